use std::borrow::Cow;

use tokio::net::TcpStream;

/// Normalize a bind/listen address.
///
/// Config files commonly use the shorthand `":PORT"` to mean "bind on all
/// interfaces". Tokio's bind APIs do not accept it, so it becomes
/// `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Socket options every relayed connection gets. Control packets are small
/// and latency bound, so Nagle stays off.
pub fn init_socket_pref(s: &TcpStream) {
    if let Err(err) = s.set_nodelay(true) {
        tracing::debug!(err=%err, "net: set_nodelay failed");
    }
}
