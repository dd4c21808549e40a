//! The hive API server proxy. This is for internal use by the `hive` tool.
//!
//! The proxy relays HTTP requests originating in a private docker network to
//! the hive controller, which usually runs outside of docker. The proxy
//! front-end runs inside the proxy container and accepts the requests; it
//! relays them to the back-end over the stdio streams of the container, using
//! a yamux session as the transport.
//!
//! The front-end also has auxiliary functions which can be triggered by the
//! back-end. Specifically, it can probe TCP endpoints to check if they are
//! alive from within the docker network.

mod back;
mod control;
mod front;

pub use back::{IncomingStreams, Proxy};
pub use control::{CheckLiveError, ProxyError};
pub use front::run_frontend;
pub use tokio_yamux::stream::StreamHandle;

pub(crate) fn lock<T>(m: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// TCP port the front-end listens on inside the proxy container.
pub const FRONTEND_PORT: u16 = 8081;

/// The source tree of this crate, embedded so the orchestrator can build the
/// proxy image without access to the repository checkout.
pub const SOURCE: &[(&str, &[u8])] = &[
    ("Dockerfile", include_bytes!("../Dockerfile")),
    ("Cargo.toml", include_bytes!("../Cargo.toml")),
    ("src/lib.rs", include_bytes!("lib.rs")),
    ("src/main.rs", include_bytes!("main.rs")),
    ("src/back.rs", include_bytes!("back.rs")),
    ("src/control.rs", include_bytes!("control.rs")),
    ("src/front.rs", include_bytes!("front.rs")),
];
