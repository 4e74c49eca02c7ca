use crate::session::Transport;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

/// Blocking serial-port transport, 9600 8N1 without flow control.
pub struct SerialTransport {
    serial: Box<dyn serialport::SerialPort>,
}

impl SerialTransport {
    pub fn open(port: &str) -> Result<Self, crate::Error> {
        Ok(Self {
            serial: serialport::new(port, 9600)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::None)
                .open()
                .map_err(|err| crate::Error::Io(err.into()))?,
        })
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
        // clear all incoming serial to avoid data collision
        loop {
            let pending = self.serial.bytes_to_read().map_err(std::io::Error::from)?;
            if pending == 0 {
                break;
            }
            let mut buf: Vec<u8> = vec![0; pending as usize];
            let received = self.serial.read(buf.as_mut_slice())?;
            log::trace!("Discarded {} pending bytes", received);
        }

        self.serial.write_all(bytes)?;
        Ok(bytes.len())
    }

    fn read_until(
        &mut self,
        terminator: u8,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> std::io::Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut count = 0;
        let mut byte = [0u8; 1];

        while count < buffer.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            self.serial
                .set_timeout(remaining)
                .map_err(std::io::Error::from)?;
            match self.serial.read_exact(&mut byte) {
                Ok(()) => {
                    if byte[0] == terminator {
                        return Ok(count);
                    }
                    buffer[count] = byte[0];
                    count += 1;
                }
                Err(err) if err.kind() == std::io::ErrorKind::TimedOut => break,
                Err(err) => return Err(err),
            }
        }

        // Deadline hit or buffer full without a terminator; hand back what
        // arrived and let validation reject it.
        Ok(count)
    }
}
