/// 传输层：带缓冲的连接、TLS 原地升级、CONNECT 隧道和双向转发
pub mod address;
pub mod conn;
pub mod dialer;
pub mod http;
pub mod io;
pub mod server;
pub mod splice;
pub mod tls;
pub mod tunnel;

pub use address::{url_to_address, NetworkAddress};
pub use conn::{Connection, OwnedReadHalf, OwnedWriteHalf, Socket, TcpConn, TlsConn};
pub use dialer::Dialer;
pub use http::{HttpRequest, HttpResponse, MAX_HEADERS};
pub use io::{Reader, Rewind, Writer, MAX_READ_SLICE_LENGTH};
pub use server::{ServerOptions, TcpServer};
pub use splice::{pipe, splice, Direction, Transferred};
pub use tls::TlsStream;
