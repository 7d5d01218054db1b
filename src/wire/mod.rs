//! Wire framing for agent stdio streams.
//!
//! - `line_buffer`: incremental `\n` framing with a per-line size limit.
//! - `codec`: [`tokio_util::codec`] adapter around the line buffer.
//! - `message`: Dialect B envelope classification and encoding.

pub mod codec;
pub mod line_buffer;
pub mod message;
