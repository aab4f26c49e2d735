use core::convert::Infallible;

use embedded_hal::{
    delay::DelayNs,
    digital::{ErrorType, InputPin, OutputPin},
};

use crate::{interface::Interface, nci, Duration, TransportError};

/// VEN low and high settle time
pub const RESET_SETTLE_MS: u32 = 10;
/// Longest pause between two IRQ samples
const MAX_BACKOFF_MS: u32 = 10;
/// Pause before retrying a NACKed write
const WAKE_RETRY_MS: u32 = 1;

/// Command/response channel to the controller
///
/// Everything the driver does to the chip goes through this trait, so a simulated
/// controller can stand in for real hardware.
pub trait Transport {
    /// Send one complete NCI frame
    fn write(&mut self, frame: &[u8]) -> Result<(), TransportError>;
    /// Read one complete NCI frame into `buf`, returns its length
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;
    /// Wait until the chip signals pending data, at most `timeout`
    fn wait_ready(&mut self, timeout: Duration) -> bool;
    /// Pulse the enable line, best effort
    fn reset(&mut self);
}

/// Placeholder for optional pins that aren't wired
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPin;

impl ErrorType for NoPin {
    type Error = Infallible;
}

impl OutputPin for NoPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
    fn set_high(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// [`Transport`] built from an [`Interface`] and `embedded-hal` pins
pub struct HalTransport<I, IRQ, VEN, D, DWL = NoPin, WK = NoPin> {
    bus: I,
    irq: IRQ,
    ven: VEN,
    delay: D,
    dwl_req: Option<DWL>,
    wkup_req: Option<WK>,
}

impl<I, IRQ, VEN, D> HalTransport<I, IRQ, VEN, D>
where
    I: Interface,
    IRQ: InputPin,
    VEN: OutputPin,
    D: DelayNs,
{
    pub fn new(bus: I, irq: IRQ, ven: VEN, delay: D) -> Self {
        Self {
            bus,
            irq,
            ven,
            delay,
            dwl_req: None,
            wkup_req: None,
        }
    }
}

impl<I, IRQ, VEN, D, DWL, WK> HalTransport<I, IRQ, VEN, D, DWL, WK> {
    /// Attach the DWL_REQ pin, it is held low so the chip always boots into NCI mode
    pub fn with_download_request<P: OutputPin>(
        self,
        pin: P,
    ) -> HalTransport<I, IRQ, VEN, D, P, WK> {
        HalTransport {
            bus: self.bus,
            irq: self.irq,
            ven: self.ven,
            delay: self.delay,
            dwl_req: Some(pin),
            wkup_req: self.wkup_req,
        }
    }

    /// Attach the WKUP_REQ pin, raised for the duration of every write
    pub fn with_wakeup_request<P: OutputPin>(
        self,
        pin: P,
    ) -> HalTransport<I, IRQ, VEN, D, DWL, P> {
        HalTransport {
            bus: self.bus,
            irq: self.irq,
            ven: self.ven,
            delay: self.delay,
            dwl_req: self.dwl_req,
            wkup_req: Some(pin),
        }
    }

    /// Run a function with access to the bus interface
    pub fn with_interface<R>(&mut self, f: impl FnOnce(&mut I) -> R) -> R {
        f(&mut self.bus)
    }

    pub fn release(self) -> (I, IRQ, VEN, D) {
        (self.bus, self.irq, self.ven, self.delay)
    }
}

impl<I, IRQ, VEN, D, DWL, WK> Transport for HalTransport<I, IRQ, VEN, D, DWL, WK>
where
    I: Interface,
    IRQ: InputPin,
    VEN: OutputPin,
    D: DelayNs,
    DWL: OutputPin,
    WK: OutputPin,
{
    fn write(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if let Some(wk) = self.wkup_req.as_mut() {
            let _ = wk.set_high();
        }
        // the chip NACKs the first address byte while it leaves standby
        let res = match self.bus.write(frame) {
            Err(TransportError::Nack) => {
                debug!("Write NACKed, retrying once");
                self.delay.delay_ms(WAKE_RETRY_MS);
                self.bus.write(frame)
            }
            res => res,
        };
        if let Some(wk) = self.wkup_req.as_mut() {
            let _ = wk.set_low();
        }
        res
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if buf.len() < nci::HEADER_LEN {
            return Err(TransportError::MalformedFrame);
        }
        self.bus.read(&mut buf[..nci::HEADER_LEN])?;
        let len = nci::HEADER_LEN + buf[2] as usize;
        if len > buf.len() {
            warn!("Frame of {} bytes doesn't fit in {}", len, buf.len());
            return Err(TransportError::MalformedFrame);
        }
        if len > nci::HEADER_LEN {
            self.bus.read(&mut buf[nci::HEADER_LEN..len])?;
        }
        Ok(len)
    }

    fn wait_ready(&mut self, timeout: Duration) -> bool {
        let timeout_ms = u32::try_from(timeout.to_millis()).unwrap_or(u32::MAX);
        let mut waited = 0u32;
        let mut backoff = 1u32;
        loop {
            match self.irq.is_high() {
                Ok(true) => return true,
                Ok(false) => (),
                Err(_) => {
                    warn!("IRQ pin read failed");
                    return false;
                }
            }
            if waited >= timeout_ms {
                trace!("Timed out waiting for IRQ after {}ms", waited);
                return false;
            }
            let step = backoff.min(timeout_ms - waited);
            self.delay.delay_ms(step);
            waited += step;
            backoff = (backoff * 2).min(MAX_BACKOFF_MS);
        }
    }

    fn reset(&mut self) {
        debug!("Hard reset via VEN");
        if let Some(dwl) = self.dwl_req.as_mut() {
            let _ = dwl.set_low();
        }
        let _ = self.ven.set_low();
        self.delay.delay_ms(RESET_SETTLE_MS);
        let _ = self.ven.set_high();
        self.delay.delay_ms(RESET_SETTLE_MS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::I2cInterface;
    use embedded_hal::i2c::{ErrorKind, NoAcknowledgeSource};
    use embedded_hal_mock::eh1::{
        delay::NoopDelay,
        digital::{Mock as PinMock, State, Transaction as PinTransaction},
        i2c::{Mock as I2cMock, Transaction as I2cTransaction},
    };

    #[test]
    fn reads_header_then_payload() {
        let i2c = I2cMock::new(&[
            I2cTransaction::read(0x28, vec![0x40, 0x00, 0x01]),
            I2cTransaction::read(0x28, vec![0x00]),
        ]);
        let mut i2c_done = i2c.clone();
        let irq = PinMock::new(&[]);
        let ven = PinMock::new(&[]);
        let (mut irq_done, mut ven_done) = (irq.clone(), ven.clone());

        let mut t = HalTransport::new(I2cInterface::new(i2c), irq, ven, NoopDelay::new());
        let mut buf = [0u8; nci::MAX_FRAME_LEN];
        let len = t.read(&mut buf).unwrap();
        assert_eq!(&buf[..len], &[0x40, 0x00, 0x01, 0x00]);

        i2c_done.done();
        irq_done.done();
        ven_done.done();
    }

    #[test]
    fn empty_payload_is_a_single_read() {
        let i2c = I2cMock::new(&[I2cTransaction::read(0x28, vec![0x60, 0x07, 0x00])]);
        let mut i2c_done = i2c.clone();
        let irq = PinMock::new(&[]);
        let ven = PinMock::new(&[]);
        let (mut irq_done, mut ven_done) = (irq.clone(), ven.clone());

        let mut t = HalTransport::new(I2cInterface::new(i2c), irq, ven, NoopDelay::new());
        let mut buf = [0u8; nci::MAX_FRAME_LEN];
        assert_eq!(t.read(&mut buf), Ok(3));

        i2c_done.done();
        irq_done.done();
        ven_done.done();
    }

    #[test]
    fn oversized_frame_is_malformed() {
        let i2c = I2cMock::new(&[I2cTransaction::read(0x28, vec![0x60, 0x05, 0x20])]);
        let mut i2c_done = i2c.clone();
        let irq = PinMock::new(&[]);
        let ven = PinMock::new(&[]);
        let (mut irq_done, mut ven_done) = (irq.clone(), ven.clone());

        let mut t = HalTransport::new(I2cInterface::new(i2c), irq, ven, NoopDelay::new());
        let mut buf = [0u8; 8];
        assert_eq!(t.read(&mut buf), Err(TransportError::MalformedFrame));

        i2c_done.done();
        irq_done.done();
        ven_done.done();
    }

    #[test]
    fn nacked_write_is_retried_once() {
        let frame = vec![0x20, 0x00, 0x01, 0x01];
        let i2c = I2cMock::new(&[
            I2cTransaction::write(0x28, frame.clone())
                .with_error(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address)),
            I2cTransaction::write(0x28, frame.clone()),
        ]);
        let mut i2c_done = i2c.clone();
        let irq = PinMock::new(&[]);
        let ven = PinMock::new(&[]);
        let wkup = PinMock::new(&[
            PinTransaction::set(State::High),
            PinTransaction::set(State::Low),
        ]);
        let (mut irq_done, mut ven_done, mut wkup_done) = (irq.clone(), ven.clone(), wkup.clone());

        let mut t = HalTransport::new(I2cInterface::new(i2c), irq, ven, NoopDelay::new())
            .with_wakeup_request(wkup);
        assert_eq!(t.write(&frame), Ok(()));

        i2c_done.done();
        irq_done.done();
        ven_done.done();
        wkup_done.done();
    }

    #[test]
    fn wait_ready_polls_until_irq_high() {
        let i2c = I2cMock::new(&[]);
        let mut i2c_done = i2c.clone();
        let irq = PinMock::new(&[
            PinTransaction::get(State::Low),
            PinTransaction::get(State::Low),
            PinTransaction::get(State::High),
        ]);
        let ven = PinMock::new(&[]);
        let (mut irq_done, mut ven_done) = (irq.clone(), ven.clone());

        let mut t = HalTransport::new(I2cInterface::new(i2c), irq, ven, NoopDelay::new());
        assert!(t.wait_ready(Duration::millis(100)));

        i2c_done.done();
        irq_done.done();
        ven_done.done();
    }

    #[test]
    fn wait_ready_gives_up_after_timeout() {
        // 1 + 2 + 2 ms of backoff before the 5ms budget runs out
        let i2c = I2cMock::new(&[]);
        let mut i2c_done = i2c.clone();
        let irq = PinMock::new(&[
            PinTransaction::get(State::Low),
            PinTransaction::get(State::Low),
            PinTransaction::get(State::Low),
            PinTransaction::get(State::Low),
        ]);
        let ven = PinMock::new(&[]);
        let (mut irq_done, mut ven_done) = (irq.clone(), ven.clone());

        let mut t = HalTransport::new(I2cInterface::new(i2c), irq, ven, NoopDelay::new());
        assert!(!t.wait_ready(Duration::millis(5)));

        i2c_done.done();
        irq_done.done();
        ven_done.done();
    }

    #[test]
    fn zero_timeout_samples_once() {
        let i2c = I2cMock::new(&[]);
        let mut i2c_done = i2c.clone();
        let irq = PinMock::new(&[PinTransaction::get(State::Low)]);
        let ven = PinMock::new(&[]);
        let (mut irq_done, mut ven_done) = (irq.clone(), ven.clone());

        let mut t = HalTransport::new(I2cInterface::new(i2c), irq, ven, NoopDelay::new());
        assert!(!t.wait_ready(Duration::millis(0)));

        i2c_done.done();
        irq_done.done();
        ven_done.done();
    }

    #[test]
    fn reset_pulses_ven_and_holds_download_low() {
        let i2c = I2cMock::new(&[]);
        let mut i2c_done = i2c.clone();
        let irq = PinMock::new(&[]);
        let ven = PinMock::new(&[
            PinTransaction::set(State::Low),
            PinTransaction::set(State::High),
        ]);
        let dwl = PinMock::new(&[PinTransaction::set(State::Low)]);
        let (mut irq_done, mut ven_done, mut dwl_done) = (irq.clone(), ven.clone(), dwl.clone());

        let mut t = HalTransport::new(I2cInterface::new(i2c), irq, ven, NoopDelay::new())
            .with_download_request(dwl);
        t.reset();

        i2c_done.done();
        irq_done.done();
        ven_done.done();
        dwl_done.done();
    }
}
