pub mod client;
pub mod config;
pub mod config_validation;
pub mod connector;
pub mod error;
pub mod line_buffer;
pub mod listener;
pub mod logging;
pub mod request_line;
pub mod session;
pub mod target;

pub use config::Config;
pub use connector::{Connector, TcpConnector};
pub use error::ProxyError;
pub use listener::{Listener, ListenerHandle};
pub use session::{ConnectionSession, Mode, SessionState};
