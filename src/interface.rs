use embedded_hal::{
    i2c::I2c,
    spi::{Operation, SpiDevice},
};

use crate::TransportError;

/// Default 7-bit I2C address of the PN7160 (I2C_ADR0 and I2C_ADR1 tied low)
pub const I2C_DEFAULT_ADDRESS: u8 = 0x28;
/// Slowest I2C clock the chip tolerates
///
/// Below this the host misses IRQ deadlines and the failures look like health check failures.
pub const MIN_I2C_FREQUENCY_HZ: u32 = 100_000;

/// Raw byte exchange with the chip
///
/// One call moves one chunk of an NCI frame; framing is handled by the transport.
pub trait Interface: Sized {
    /// Write a complete NCI frame
    fn write(&mut self, buf: &[u8]) -> Result<(), TransportError>;
    /// Fill `buf` with the next bytes the chip has queued
    fn read(&mut self, buf: &mut [u8]) -> Result<(), TransportError>;
}

pub struct I2cInterface<I: I2c> {
    i2c: I,
    address: u8,
}

impl<I: I2c> I2cInterface<I> {
    pub fn new(i2c: I) -> Self {
        Self::with_address(i2c, I2C_DEFAULT_ADDRESS)
    }

    pub fn with_address(i2c: I, address: u8) -> Self {
        Self { i2c, address }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn release(self) -> I {
        self.i2c
    }
}

impl<I: I2c> Interface for I2cInterface<I> {
    fn write(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        trace!("I2C write {:?}", buf);
        self.i2c
            .write(self.address, buf)
            .map_err(TransportError::from_i2c)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        self.i2c
            .read(self.address, buf)
            .map_err(TransportError::from_i2c)?;
        trace!("I2C read {:?}", buf);
        Ok(())
    }
}

pub mod spi_modes {
    /// Transfer direction byte preceding a host to chip transfer
    pub const WRITE: u8 = 0x7F;
    /// Transfer direction byte preceding a chip to host transfer
    pub const READ: u8 = 0xFF;
}

/// SPI framing, chip select is driven by the [`SpiDevice`]
pub struct SpiInterface<S: SpiDevice> {
    dev: S,
}

impl<S: SpiDevice> SpiInterface<S> {
    pub fn new(dev: S) -> Self {
        Self { dev }
    }

    pub fn release(self) -> S {
        self.dev
    }
}

impl<S: SpiDevice> Interface for SpiInterface<S> {
    fn write(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        trace!("SPI write {:?}", buf);
        self.dev
            .transaction(&mut [
                Operation::Write(&[spi_modes::WRITE]),
                Operation::Write(buf),
            ])
            .map_err(TransportError::from_spi)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        self.dev
            .transaction(&mut [
                Operation::Write(&[spi_modes::READ]),
                Operation::Read(buf),
            ])
            .map_err(TransportError::from_spi)?;
        trace!("SPI read {:?}", buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal::i2c::{ErrorKind, NoAcknowledgeSource};
    use embedded_hal_mock::eh1::{
        i2c::{Mock as I2cMock, Transaction as I2cTransaction},
        spi::{Mock as SpiMock, Transaction as SpiTransaction},
    };

    #[test]
    fn i2c_write_goes_to_default_address() {
        let expectations = [I2cTransaction::write(0x28, vec![0x20, 0x00, 0x01, 0x01])];
        let i2c = I2cMock::new(&expectations);
        let mut i2c_clone = i2c.clone();

        let mut iface = I2cInterface::new(i2c);
        assert_eq!(iface.address(), I2C_DEFAULT_ADDRESS);
        iface.write(&[0x20, 0x00, 0x01, 0x01]).unwrap();

        i2c_clone.done();
    }

    #[test]
    fn i2c_nack_maps_to_nack() {
        let expectations = [I2cTransaction::write(0x29, vec![0x20, 0x01, 0x00])
            .with_error(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address))];
        let i2c = I2cMock::new(&expectations);
        let mut i2c_clone = i2c.clone();

        let mut iface = I2cInterface::with_address(i2c, 0x29);
        assert_eq!(iface.write(&[0x20, 0x01, 0x00]), Err(TransportError::Nack));

        i2c_clone.done();
    }

    #[test]
    fn i2c_other_errors_map_to_bus() {
        let expectations = [I2cTransaction::read(0x28, vec![0x00; 3]).with_error(ErrorKind::Bus)];
        let i2c = I2cMock::new(&expectations);
        let mut i2c_clone = i2c.clone();

        let mut iface = I2cInterface::new(i2c);
        let mut buf = [0u8; 3];
        assert_eq!(iface.read(&mut buf), Err(TransportError::Bus));

        i2c_clone.done();
    }

    #[test]
    fn spi_frames_carry_direction_byte() {
        let expectations = [
            SpiTransaction::transaction_start(),
            SpiTransaction::write_vec(vec![spi_modes::WRITE]),
            SpiTransaction::write_vec(vec![0x20, 0x00, 0x01, 0x01]),
            SpiTransaction::transaction_end(),
            SpiTransaction::transaction_start(),
            SpiTransaction::write_vec(vec![spi_modes::READ]),
            SpiTransaction::read_vec(vec![0x40, 0x00, 0x01]),
            SpiTransaction::transaction_end(),
        ];
        let spi = SpiMock::new(&expectations);
        let mut spi_clone = spi.clone();

        let mut iface = SpiInterface::new(spi);
        iface.write(&[0x20, 0x00, 0x01, 0x01]).unwrap();
        let mut header = [0u8; 3];
        iface.read(&mut header).unwrap();
        assert_eq!(header, [0x40, 0x00, 0x01]);

        spi_clone.done();
    }
}
