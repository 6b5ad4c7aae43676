mod codec;
mod proxy;

pub use codec::{AbciCodec, DEFAULT_MAX_FRAME_LEN};
pub use proxy::{strip_tcp_scheme, AbciProxy, Route};
