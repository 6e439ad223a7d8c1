//! Compiled-in utility filters.
//!
//! The shipped set is intentionally small: a file source, a file sink
//! and a pass-through. Everything else is expected to come from filter
//! crates registering their own types on the session.

use sluice_rt::FilterSession;

mod filein;
mod fileout;
mod passthrough;

pub fn register_all(session: &FilterSession) {
    session.register(filein::register());
    session.register(fileout::register());
    session.register(passthrough::register());
}
