//! # tpm-keyserver
//!
//! A broker that releases disk encryption passphrases to machines able to
//! prove which hardware module they carry, and the boot time client that
//! asks for them.
//!
//! ## Run the broker
//! ```bash
//! tpm-keyserver serve --store /var/lib/keyserver
//! ```
//!
//! ## Ask for a passphrase from an initramfs
//! ```bash
//! echo '{"data": "{\"label\": \"COS_PERSISTENT\"}"}' \
//!     | KEYSERVER_URL=http://10.0.0.1:8082 tpm-keyserver discovery discovery.password
//! ```
//!
//! Talking to a real TPM needs the `tpm` feature and the tss2 libraries.

pub mod attest;
pub mod channel;
pub mod cli;
pub mod client;
pub mod config;
pub mod identity;
pub mod materializer;
pub mod payload;
pub mod plugin;
pub mod seal;
pub mod server;
pub mod session;
pub mod store;
#[cfg(feature = "tpm")]
pub mod tpm;
pub mod volume;
