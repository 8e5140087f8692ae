use bitflags::bitflags;

bitflags! {
    /// https://httpwg.org/specs/rfc7540.html#DATA
    #[repr(transparent)]
    pub struct DataFlags: u8 {
        /// Last frame the endpoint will send for this stream.
        const END_STREAM = 0x1;
        /// Pad Length field and trailing padding are present.
        const PADDED = 0x8;
    }

    /// https://httpwg.org/specs/rfc7540.html#HEADERS
    #[repr(transparent)]
    pub struct HeadersFlags: u8 {
        /// The header block ends the stream. CONTINUATION frames may
        /// still follow; they are logically part of this frame.
        const END_STREAM = 0x1;
        /// Entire header block is in this frame, no CONTINUATION
        /// follows. Absent, the very next frame MUST be a
        /// CONTINUATION on the same stream.
        const END_HEADERS = 0x4;
        /// Pad Length field and trailing padding are present.
        const PADDED = 0x8;
        /// Exclusive flag, stream dependency and weight are present.
        const PRIORITY = 0x20;
    }

    /// https://httpwg.org/specs/rfc7540.html#SETTINGS
    #[repr(transparent)]
    pub struct SettingsFlags: u8 {
        /// Acknowledges the peer's SETTINGS; the payload MUST be
        /// empty, anything else is a FRAME_SIZE_ERROR.
        const ACK = 0x1;
    }

    /// https://httpwg.org/specs/rfc7540.html#PUSH_PROMISE
    #[repr(transparent)]
    pub struct PushPromiseFlags: u8 {
        /// Entire header block is in this frame.
        const END_HEADERS = 0x4;
        /// Pad Length field and trailing padding are present.
        const PADDED = 0x8;
    }

    /// https://httpwg.org/specs/rfc7540.html#PING
    #[repr(transparent)]
    pub struct PingFlags: u8 {
        /// This PING is a response; never respond to it again.
        const ACK = 0x1;
    }

    /// https://httpwg.org/specs/rfc7540.html#CONTINUATION
    #[repr(transparent)]
    pub struct ContinuationFlags: u8 {
        /// This frame ends the header block.
        const END_HEADERS = 0x4;
    }
}
