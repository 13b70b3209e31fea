//! Reference backends for the store, queue and artifact contracts.

pub mod memory;

#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub mod postgres;
