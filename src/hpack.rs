use crate::{headers::Headers, types::DEFAULT_HEADER_TABLE_SIZE};
use derivative::Derivative;
use log::debug;

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    /// Maps to COMPRESSION_ERROR at the connection level.
    #[error("header block decode failed: {0:?}")]
    Decode(hpack::decoder::DecoderError),
}

/// Header-block compression context for one connection, one per
/// direction. Wraps the `hpack` crate; the grow-on-overflow loop of
/// the abstract encoder contract is subsumed by the crate returning an
/// owned, sized buffer.
/// https://httpwg.org/specs/rfc7541.html
#[derive(Derivative)]
#[derivative(Debug)]
pub struct HeaderCodec {
    #[derivative(Debug = "ignore")]
    encoder: hpack::Encoder<'static>,
    #[derivative(Debug = "ignore")]
    decoder: hpack::Decoder<'static>,
    peer_table_size: u32,
}

impl HeaderCodec {
    #[must_use]
    pub fn new(own_table_size: u32) -> Self {
        let mut decoder = hpack::Decoder::new();
        decoder.set_max_table_size(own_table_size as usize);
        Self {
            encoder: hpack::Encoder::new(),
            decoder,
            peer_table_size: DEFAULT_HEADER_TABLE_SIZE,
        }
    }

    /// Encode headers in order into a fresh block.
    pub fn encode<'a>(
        &mut self,
        headers: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Vec<u8> {
        self.encoder.encode(
            headers
                .into_iter()
                .map(|(name, value)| (name.as_bytes(), value.as_bytes())),
        )
    }

    /// Decode a complete header block, preserving order and duplicates.
    pub fn decode(&mut self, block: &[u8]) -> Result<Headers, CodecError> {
        let mut headers = Headers::new();
        self.decoder
            .decode_with_cb(block, |name, value| {
                headers.add(
                    String::from_utf8_lossy(&name).to_string(),
                    String::from_utf8_lossy(&value).to_string(),
                );
            })
            .map_err(CodecError::Decode)?;
        Ok(headers)
    }

    /// Peer SETTINGS_HEADER_TABLE_SIZE: bounds our encoder's dynamic
    /// table. The wrapped encoder keeps its own table policy; the
    /// bound is recorded so a shrinking peer is at least visible.
    pub fn set_peer_table_size(&mut self, size: u32) {
        if size != self.peer_table_size {
            debug!("peer header table size {} -> {size}", self.peer_table_size);
            self.peer_table_size = size;
        }
    }

    /// Our SETTINGS_HEADER_TABLE_SIZE: bounds the decoder table.
    pub fn set_own_table_size(&mut self, size: u32) {
        self.decoder.set_max_table_size(size as usize);
    }
}
