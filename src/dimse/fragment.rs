//! Reassembly of DIMSE command/data streams from P-Data-TF fragments.
//!
//! Grounded on the original implementation's `CommandAssembler`/`AddDataPDU`
//! (a message is fully received once a "command last" fragment has been
//! seen and, if the command carries a data set, a "data last" fragment has
//! been seen too) and on this crate's own [`crate::association::pdata`]
//! splitter, which this assembler is the left inverse of.

use snafu::{ResultExt, Snafu};

use crate::dimse::{self, Message};
use crate::pdu::{PDataValue, PDataValueType};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display(
        "P-Data fragment for context {} arrived while assembling message on context {}",
        got,
        expected
    ))]
    MixedContext { expected: u8, got: u8 },

    #[snafu(display("received a second \"last\" fragment for the {} stream", stream))]
    DuplicateLast { stream: &'static str },

    #[snafu(display("failed to decode DIMSE command"))]
    Decode { source: dimse::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A fully reassembled DIMSE message: a command, and its associated data
/// set bytes if the command declared one.
#[derive(Debug)]
pub struct Assembled {
    pub context_id: u8,
    pub command: Message,
    pub data: Option<Vec<u8>>,
}

/// Incrementally reconstructs `(command, data)` pairs from a stream of
/// P-Data-TF value items.
///
/// One assembler is used per association per direction. Feeding items from
/// two different contexts into the same assembler without an emission in
/// between is a protocol violation ([`Error::MixedContext`]).
#[derive(Debug, Default)]
pub struct Assembler {
    context_id: Option<u8>,
    command_buf: Vec<u8>,
    command_done: bool,
    data_buf: Vec<u8>,
    data_done: bool,
    data_started: bool,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one P-Data value item into the assembler.
    ///
    /// Returns `Ok(Some(..))` once a full message has been reassembled,
    /// in which case the assembler is reset and ready for the next
    /// message. Returns `Ok(None)` while a message is still incomplete.
    pub fn add(&mut self, value: PDataValue) -> Result<Option<Assembled>> {
        match self.context_id {
            None => self.context_id = Some(value.presentation_context_id),
            Some(ctx) if ctx == value.presentation_context_id => {}
            Some(ctx) => {
                return MixedContextSnafu {
                    expected: ctx,
                    got: value.presentation_context_id,
                }
                .fail();
            }
        }

        match value.value_type {
            PDataValueType::Command => {
                if self.command_done {
                    return DuplicateLastSnafu { stream: "command" }.fail();
                }
                self.command_buf.extend_from_slice(&value.data);
                if value.is_last {
                    self.command_done = true;
                }
            }
            PDataValueType::Data => {
                if self.data_done {
                    return DuplicateLastSnafu { stream: "data" }.fail();
                }
                self.data_started = true;
                self.data_buf.extend_from_slice(&value.data);
                if value.is_last {
                    self.data_done = true;
                }
            }
        }

        if !self.command_done {
            return Ok(None);
        }

        // Peek at the command to learn whether a data set is expected;
        // this requires a full decode, but it is cheap (command sets are
        // a handful of elements) and only happens once per message.
        let command = Message::decode(&self.command_buf).context(DecodeSnafu)?;
        let needs_data = command.has_data();

        if needs_data && !self.data_done {
            return Ok(None);
        }

        let context_id = self.context_id.take().expect("context id set above");
        let data = if needs_data {
            Some(std::mem::take(&mut self.data_buf))
        } else {
            None
        };
        self.command_buf.clear();
        self.command_done = false;
        self.data_buf.clear();
        self.data_done = false;
        self.data_started = false;

        Ok(Some(Assembled {
            context_id,
            command,
            data,
        }))
    }
}

/// Split a command (and optional data) buffer into P-Data value items no
/// larger than `max_chunk_size` bytes each, with the last bit set on the
/// final fragment of each stream. This is the splitter DT-1 uses, and the
/// left inverse [`Assembler`] reconstructs from its output.
pub fn split(
    context_id: u8,
    command: &[u8],
    data: Option<&[u8]>,
    max_chunk_size: usize,
) -> Vec<PDataValue> {
    let max_chunk_size = max_chunk_size.max(1);
    let mut items = Vec::new();
    split_into(context_id, command, max_chunk_size, PDataValueType::Command, &mut items);
    if let Some(data) = data {
        split_into(context_id, data, max_chunk_size, PDataValueType::Data, &mut items);
    }
    items
}

fn split_into(
    context_id: u8,
    bytes: &[u8],
    max_chunk_size: usize,
    value_type: PDataValueType,
    out: &mut Vec<PDataValue>,
) {
    if bytes.is_empty() {
        out.push(PDataValue {
            presentation_context_id: context_id,
            value_type,
            is_last: true,
            data: Vec::new(),
        });
        return;
    }
    let mut offset = 0;
    while offset < bytes.len() {
        let end = (offset + max_chunk_size).min(bytes.len());
        out.push(PDataValue {
            presentation_context_id: context_id,
            value_type: value_type.clone(),
            is_last: end == bytes.len(),
            data: bytes[offset..end].to_vec(),
        });
        offset = end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimse::{Message, Priority};

    #[test]
    fn reassembles_a_split_command_without_data() {
        let command = Message::c_echo_rq(42).encode().unwrap();
        let items = split(1, &command, None, 16);
        assert!(items.len() > 1, "expected the command to be split");

        let mut assembler = Assembler::new();
        let mut result = None;
        for item in items {
            result = assembler.add(item).unwrap();
        }
        let assembled = result.expect("message should be complete");
        assert_eq!(assembled.context_id, 1);
        assert_eq!(assembled.command.message_id().unwrap(), 42);
        assert!(assembled.data.is_none());
    }

    #[test]
    fn reassembles_a_split_command_with_data() {
        let command = Message::c_store_rq(
            1,
            "1.2.840.10008.5.1.4.1.1.7",
            "1.2.3.4.5.6",
            Priority::Medium,
            None,
        )
        .encode()
        .unwrap();
        let data: Vec<u8> = (0..6000u32).map(|x| x as u8).collect();
        let items = split(3, &command, Some(&data), 500);

        let mut assembler = Assembler::new();
        let mut result = None;
        for item in items {
            result = assembler.add(item).unwrap();
        }
        let assembled = result.expect("message should be complete");
        assert_eq!(assembled.data.unwrap(), data);
    }

    #[test]
    fn rejects_mixed_context() {
        let mut assembler = Assembler::new();
        assembler
            .add(PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: false,
                data: vec![1, 2, 3],
            })
            .unwrap();

        let err = assembler.add(PDataValue {
            presentation_context_id: 3,
            value_type: PDataValueType::Command,
            is_last: true,
            data: vec![4, 5, 6],
        });
        assert!(matches!(
            err,
            Err(Error::MixedContext { expected: 1, got: 3 })
        ));
    }
}
