use anyhow::{anyhow, Context, Result};
use linux_embedded_hal::spidev::{SpiModeFlags, SpidevOptions};
use linux_embedded_hal::sysfs_gpio::Direction;
use linux_embedded_hal::{SpidevDevice, SysfsPin};
use log::{debug, info, warn};
use spi_handshake_stream::config::Config;
use spi_handshake_stream::peer::PeerMaster;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::sleep;

pub struct Daemon {
    master: PeerMaster<SpidevDevice, SysfsPin>,
    config: Config,
    input: mpsc::Receiver<Vec<u8>>,
    input_closed: bool,
}

impl Daemon {
    pub fn new(config: Config, input: mpsc::Receiver<Vec<u8>>) -> Result<Self> {
        let mut spi = SpidevDevice::open(&config.spi.device)
            .map_err(|e| anyhow!("Failed to open SPI device {}: {:?}", config.spi.device, e))?;
        let options = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(config.spi.speed_hz)
            .mode(spi_mode(config.spi.mode)?)
            .build();
        spi.configure(&options)
            .context(format!("Failed to configure SPI device: {}", config.spi.device))?;
        info!("SPI device initialized: {}", config.spi.device);

        let handshake = SysfsPin::new(config.handshake.gpio);
        handshake
            .export()
            .context(format!("Failed to export handshake GPIO {}", config.handshake.gpio))?;
        handshake
            .set_direction(Direction::In)
            .context("Failed to set handshake GPIO direction")?;
        info!(
            "Handshake GPIO {} active {:?}",
            config.handshake.gpio, config.handshake.active_level
        );
        info!("Polling interval: {}ms", config.polling.interval_ms);

        let master = PeerMaster::new(
            spi,
            handshake,
            config.handshake.active_level,
            config.spi.address_bits,
        );

        Ok(Daemon {
            master,
            config,
            input,
            input_closed: false,
        })
    }

    pub async fn poll(&mut self) -> Result<()> {
        // Hand everything read from stdin so far to the slave.
        while !self.input_closed {
            match self.input.try_recv() {
                Ok(data) => self.master.queue_send(&data)?,
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    info!("Input closed, {} bytes still queued", self.master.pending_send());
                    self.input_closed = true;
                }
            }
        }

        let serviced = self.master.run_until_idle(self.config.polling.max_polls)?;
        if serviced > 0 {
            debug!("Serviced {} handshakes", serviced);
        }

        let received = self.master.take_received();
        if !received.is_empty() {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&received).await?;
            stdout.flush().await?;
        }

        // Sleep for the configured polling interval
        sleep(Duration::from_millis(self.config.polling.interval_ms)).await;

        Ok(())
    }

    pub fn reload_config(&mut self, new_config: Config) -> Result<()> {
        if new_config.spi.device != self.config.spi.device
            || new_config.handshake.gpio != self.config.handshake.gpio
        {
            warn!("SPI device and handshake changes take effect after a restart");
        }
        self.config.polling = new_config.polling;
        info!(
            "Polling interval now {}ms, at most {} handshakes per poll",
            self.config.polling.interval_ms, self.config.polling.max_polls
        );
        Ok(())
    }
}

fn spi_mode(mode: u8) -> Result<SpiModeFlags> {
    match mode {
        0 => Ok(SpiModeFlags::SPI_MODE_0),
        1 => Ok(SpiModeFlags::SPI_MODE_1),
        2 => Ok(SpiModeFlags::SPI_MODE_2),
        3 => Ok(SpiModeFlags::SPI_MODE_3),
        _ => Err(anyhow!("Invalid SPI mode {}, expected 0-3", mode)),
    }
}
