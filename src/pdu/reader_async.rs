//! Asynchronous PDU reading, mirroring [`super::reader`] but over
//! [`tokio::io::AsyncRead`] streams.

use snafu::{ensure, ResultExt};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::reader::{
    decode_pdu_payload, InvalidMaxPduSnafu, NoPduAvailableSnafu, PduTooLargeSnafu,
    ReadPduFieldSnafu, ReadPduSnafu, Result, MAXIMUM_PDU_SIZE, MINIMUM_PDU_SIZE,
};
use crate::pdu::Pdu;

/// Read a single PDU from an asynchronous stream.
///
/// Behaves exactly like [`super::reader::read_pdu`]: the header is read
/// first, then exactly as many payload bytes as it announces, then the
/// payload is decoded with the same field-by-field logic used by the
/// blocking reader.
pub async fn read_pdu<R>(reader: &mut R, max_pdu_length: u32, strict: bool) -> Result<Pdu>
where
    R: AsyncRead + Unpin,
{
    ensure!(
        (MINIMUM_PDU_SIZE..=MAXIMUM_PDU_SIZE).contains(&max_pdu_length),
        InvalidMaxPduSnafu { max_pdu_length }
    );

    let mut type_and_reserved = [0u8; 2];
    if let Err(e) = reader.read_exact(&mut type_and_reserved).await {
        ensure!(
            e.kind() != std::io::ErrorKind::UnexpectedEof,
            NoPduAvailableSnafu
        );
        return Err(e).context(ReadPduFieldSnafu { field: "type" });
    }
    let pdu_type = type_and_reserved[0];

    let mut length_bytes = [0u8; 4];
    reader
        .read_exact(&mut length_bytes)
        .await
        .context(ReadPduFieldSnafu { field: "length" })?;
    let pdu_length = u32::from_be_bytes(length_bytes);

    if strict {
        ensure!(
            pdu_length <= max_pdu_length,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length
            }
        );
    } else if pdu_length > max_pdu_length {
        ensure!(
            pdu_length <= MAXIMUM_PDU_SIZE,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length: MAXIMUM_PDU_SIZE
            }
        );
        tracing::warn!(
            "Incoming pdu was too large: length {}, maximum is {}",
            pdu_length,
            max_pdu_length
        );
    }

    let mut bytes = vec![0u8; pdu_length as usize];
    reader
        .read_exact(&mut bytes)
        .await
        .context(ReadPduSnafu)?;

    decode_pdu_payload(pdu_type, bytes)
}
