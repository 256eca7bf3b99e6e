use crate::relay::FrameSink;
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant;

/// In-memory smoltcp device: frames from the interface are queued one at a
/// time by the engine, and everything smoltcp transmits goes straight to the
/// engine's [`FrameSink`].
pub struct EngineDevice<S: FrameSink> {
    sink: S,
    max_frame_len: usize,
    rx_buffer: Vec<u8>,
    rx_len: Option<usize>,
    tx_buffer: Vec<u8>,
}

impl<S: FrameSink> EngineDevice<S> {
    pub fn new(sink: S, mtu: usize) -> Self {
        let max_frame_len = mtu + 14; // MTU + ethernet header
        Self {
            sink,
            max_frame_len,
            rx_buffer: vec![0u8; max_frame_len],
            rx_len: None,
            tx_buffer: vec![0u8; max_frame_len],
        }
    }

    /// Queue a frame for the next interface poll.
    ///
    /// Returns false (and drops the frame) when it exceeds the MTU.
    pub fn push_rx(&mut self, frame: &[u8]) -> bool {
        if frame.len() > self.max_frame_len {
            return false;
        }
        self.rx_buffer[..frame.len()].copy_from_slice(frame);
        self.rx_len = Some(frame.len());
        true
    }

    /// True while a queued frame awaits the next interface poll.
    pub fn has_pending_rx(&self) -> bool {
        self.rx_len.is_some()
    }

    /// Deliver a frame built outside smoltcp.
    pub fn send_frame(&mut self, frame: &[u8]) {
        self.sink.deliver(frame);
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }
}

impl<S: FrameSink> Device for EngineDevice<S> {
    type RxToken<'a>
        = EngineRxToken<'a>
    where
        Self: 'a;
    type TxToken<'a>
        = EngineTxToken<'a, S>
    where
        Self: 'a;

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.max_transmission_unit = self.max_frame_len;
        caps.medium = Medium::Ethernet;
        caps
    }

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let len = self.rx_len.take()?;
        let rx_token = EngineRxToken {
            buffer: &self.rx_buffer[..len],
        };
        let tx_token = EngineTxToken {
            buffer: &mut self.tx_buffer,
            sink: &mut self.sink,
        };
        Some((rx_token, tx_token))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(EngineTxToken {
            buffer: &mut self.tx_buffer,
            sink: &mut self.sink,
        })
    }
}

/// Borrow of the queued guest frame.
pub struct EngineRxToken<'a> {
    buffer: &'a [u8],
}

impl RxToken for EngineRxToken<'_> {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(self.buffer)
    }
}

/// Writes into the scratch buffer, then hands the frame to the sink.
pub struct EngineTxToken<'a, S: FrameSink> {
    buffer: &'a mut Vec<u8>,
    sink: &'a mut S,
}

impl<S: FrameSink> TxToken for EngineTxToken<'_, S> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        if self.buffer.len() < len {
            self.buffer.resize(len, 0);
        }
        let buf = &mut self.buffer[..len];
        let result = f(buf);
        self.sink.deliver(buf);
        result
    }
}
