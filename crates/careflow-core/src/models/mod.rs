//! Domain models for the careflow ledger.

mod attachment;
mod clinical;
mod discharge;
mod episode;
pub mod keys;
mod pointer;
mod timeline;

pub use attachment::*;
pub use clinical::*;
pub use discharge::*;
pub use episode::*;
pub use pointer::*;
pub use timeline::*;
