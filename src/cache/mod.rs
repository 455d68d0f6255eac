//! Content-addressed source cache
//!
//! Recipe sources are cached by the digest the recipe declares. An object is
//! only admitted after its bytes hash to that digest, so a cache hit can skip
//! the network entirely.
//!
//! # Layout
//!
//! | Path | Description |
//! |------|-------------|
//! | `objects/<algorithm>/<hex>` | Verified source, immutable |
//! | `tmp/<uuid>.part` | Download in progress, discarded on failure |
//! | `index.json` | Sizes, file names and LRU timestamps |

pub mod digest;
pub mod fetch;
pub mod store;

pub use digest::{Algorithm, Digest};
pub use fetch::{Fetcher, FileTransport, HttpTransport, RetryPolicy, SchemeTransport, Transport};
pub use store::{format_bytes, mb_to_bytes, CacheEntry, CachePin, CacheStore};
