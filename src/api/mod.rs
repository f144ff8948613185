//! 出站 API 层：调用描述、缓存、传输、凭据与网关

pub mod cache;
pub mod gateway;
pub mod mock;
pub mod request;
pub mod session;
pub mod transport;

pub use cache::CacheStore;
pub use gateway::{ApiResponse, GatewayConfig, GatewayEvent, RequestGateway};
pub use mock::ScriptedTransport;
pub use request::{CallDescriptor, CallOptions, Method};
pub use session::{CredentialStore, Credentials, FileCredentialStore, MemoryCredentialStore};
pub use transport::{ReqwestTransport, Transport, TransportRequest, TransportResponse};
