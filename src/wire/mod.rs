//! Binary wire formats and the history-drain helpers.

mod history;
mod io;

pub use history::{
    deserialize_expected, deserialize_history, empty_history, serialize_expected,
    serialize_history, serialize_thread_mapping, DecodedEvent, DecodedTrace,
};
pub use io::{WireReader, WireValue, WireWriter};
