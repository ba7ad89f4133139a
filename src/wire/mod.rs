pub mod control;
pub mod length_encoded;

pub use control::{ControlMessage, ControlMsgWriter, FlushId, FlushIdGenerator, TimeRange};
pub use length_encoded::{read_record, LengthEncodedWriter, RecordWriter, CONTROL_FIELD_NAME};
