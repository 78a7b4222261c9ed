pub mod addr;
pub mod dialer;
pub mod error;
pub mod stream;

pub use addr::Address;
pub use dialer::{Dialer, DialerConfig};
pub use error::{HandshakeStage, ProxyError, ProxyErrorKind};
pub use stream::{PrefixedStream, ProxyStream};
