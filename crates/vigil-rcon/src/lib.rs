pub mod codec;
pub mod session;

pub use codec::{DecodeError, EncodeError, Packet, TYPE_AUTH, TYPE_EXEC_COMMAND};
pub use session::{ConnectError, ExecError, RconSession};
