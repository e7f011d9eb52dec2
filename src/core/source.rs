//! Line-oriented reading source backed by the serial-attached probe.

use std::io::{BufReader, ErrorKind, Read};
use std::time::{Duration, Instant};

use crate::prelude::*;
use crate::settings::SerialSettings;

/// Longer lines than this are discarded as noise.
const MAX_LINE_LENGTH: usize = 4096;

type ProbePort = BufReader<Box<dyn serialport::SerialPort>>;

/// Something the ingestion loop can poll for one reading at a time.
pub trait Source: Send {
    /// Consumes at most one line from the underlying stream.
    ///
    /// Returns `Ok(None)` when no complete line arrived within the read
    /// timeout or when the line is noise. Returns `Err` only on an I/O
    /// failure, after which the source must be considered disconnected.
    fn read_one(&mut self) -> Result<Option<Reading>>;
}

pub struct SerialSource<R = ProbePort> {
    reader: R,

    /// Bounds one `read_one` call, busy stream or not.
    read_timeout: Duration,

    /// Partially received line, kept across `read_one` calls.
    pending: Vec<u8>,

    /// Set while skipping the rest of an overlong line.
    discarding: bool,
}

impl SerialSource {
    pub fn open(settings: &SerialSettings) -> Result<Self> {
        let read_timeout = Duration::from_millis(settings.read_timeout_ms);
        let port = serialport::new(&settings.port, settings.baud_rate)
            .timeout(read_timeout)
            .open()
            .with_context(|| format!("failed to open the serial port `{}`", settings.port))?;
        info!("connected to `{}` at {} baud", settings.port, settings.baud_rate);
        Ok(Self {
            reader: BufReader::new(port),
            read_timeout,
            pending: Vec::new(),
            discarding: false,
        })
    }
}

impl<R: Read + Send> Source for SerialSource<R> {
    fn read_one(&mut self) -> Result<Option<Reading>> {
        let deadline = Instant::now() + self.read_timeout;
        let mut byte = [0u8; 1];
        loop {
            if Instant::now() >= deadline {
                // The line is unfinished, the tick must go on. The received
                // part stays in `pending` for the next call.
                return Ok(None);
            }
            match self.reader.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) if byte[0] == b'\n' => {
                    if self.discarding {
                        self.discarding = false;
                        return Ok(None);
                    }
                    let reading = Reading::from_line(&self.pending);
                    self.pending.clear();
                    return Ok(reading);
                }
                Ok(_) => {
                    if self.discarding {
                        continue;
                    }
                    if self.pending.len() >= MAX_LINE_LENGTH {
                        debug!("discarding an overlong line");
                        self.pending.clear();
                        self.discarding = true;
                        continue;
                    }
                    self.pending.push(byte[0]);
                }
                Err(error) if error.kind() == ErrorKind::TimedOut => return Ok(None),
                Err(error) => {
                    return Err(error).context("failed to read from the serial port");
                }
            }
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Feeds a scripted sequence of lines and errors to the ingestion loop.
    pub struct ScriptedSource {
        pub lines: Vec<Result<Option<&'static [u8]>>>,
    }

    impl Source for ScriptedSource {
        fn read_one(&mut self) -> Result<Option<Reading>> {
            if self.lines.is_empty() {
                return Ok(None);
            }
            match self.lines.remove(0) {
                Ok(Some(line)) => Ok(Reading::from_line(line)),
                Ok(None) => Ok(None),
                Err(error) => Err(error),
            }
        }
    }

    /// Yields the queued bytes one at a time, then times out like an idle
    /// serial port.
    struct FeedReader {
        data: VecDeque<u8>,
    }

    impl Read for FeedReader {
        fn read(&mut self, buffer: &mut [u8]) -> std::io::Result<usize> {
            match self.data.pop_front() {
                Some(byte) => {
                    buffer[0] = byte;
                    Ok(1)
                }
                None => Err(std::io::Error::new(ErrorKind::TimedOut, "no more bytes")),
            }
        }
    }

    /// A port stuck at the wrong baud rate: bytes keep coming, newlines never do.
    struct EndlessNoise;

    impl Read for EndlessNoise {
        fn read(&mut self, buffer: &mut [u8]) -> std::io::Result<usize> {
            buffer[0] = b'x';
            Ok(1)
        }
    }

    fn source<R: Read + Send>(reader: R, timeout_ms: u64) -> SerialSource<R> {
        SerialSource {
            reader,
            read_timeout: Duration::from_millis(timeout_ms),
            pending: Vec::new(),
            discarding: false,
        }
    }

    #[test]
    fn a_stream_without_newlines_cannot_stall_the_tick() -> Result {
        let mut source = source(EndlessNoise, 50);
        let started = Instant::now();
        assert!(source.read_one()?.is_none());
        assert!(started.elapsed() < Duration::from_secs(2));
        Ok(())
    }

    #[test]
    fn a_partial_line_survives_across_calls() -> Result {
        let mut source = source(
            FeedReader {
                data: b"{\"moisture\":4".iter().copied().collect(),
            },
            1000,
        );
        assert!(source.read_one()?.is_none());

        source.reader.data.extend(b"5}\n");
        let reading = source.read_one()?.expect("expected a reading");
        assert_eq!(reading.moisture, 45);
        Ok(())
    }

    #[test]
    fn an_overlong_line_is_discarded_whole() -> Result {
        let mut data: VecDeque<u8> = std::iter::repeat(b'x').take(MAX_LINE_LENGTH + 100).collect();
        data.extend(b"\n{\"moisture\":45}\n");
        let mut source = source(FeedReader { data }, 1000);

        // The tail of the noise line must not resurface as a reading.
        assert!(source.read_one()?.is_none());
        let reading = source.read_one()?.expect("expected a reading");
        assert_eq!(reading.moisture, 45);
        Ok(())
    }
}
