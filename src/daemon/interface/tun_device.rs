//! TUN device backed interface.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::Mutex,
};
use tracing::{debug, info};
use tun::AsyncDevice;

use crate::daemon::shutdown::Shutdown;

use super::{InterfaceError, InterfaceFuture, VirtualInterface};

pub struct TunInterface {
    name: String,
    reader: Mutex<ReadHalf<AsyncDevice>>,
    /// Taken out on close so the device is released once the reader goes too.
    writer: Mutex<Option<WriteHalf<AsyncDevice>>>,
    closed: Shutdown,
}

impl TunInterface {
    /// Creates the device, assigns `self_ip` with the subnet's netmask, sets the MTU and brings
    /// the link up.
    pub fn create(
        name: &str,
        subnet: Ipv4Net,
        self_ip: Ipv4Addr,
        mtu: u16,
    ) -> Result<Self, InterfaceError> {
        let mut configuration = tun::configure();
        configuration
            .name(name)
            .address(self_ip)
            .netmask(subnet.netmask())
            .mtu(i32::from(mtu))
            .up();
        #[cfg(target_os = "linux")]
        configuration.platform(|platform| {
            platform.packet_information(false);
        });
        let device = tun::create_as_async(&configuration)?;
        let (reader, writer) = tokio::io::split(device);
        info!("Created TUN device {} with IP {}/{}", name, self_ip, subnet.prefix_len());
        Ok(Self {
            name: name.to_string(),
            reader: Mutex::new(reader),
            writer: Mutex::new(Some(writer)),
            closed: Shutdown::new(),
        })
    }
}

impl VirtualInterface for TunInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn read<'a>(&'a self, buffer: &'a mut [u8]) -> InterfaceFuture<'a, usize> {
        Box::pin(async move {
            let mut reader = self.reader.lock().await;
            tokio::select! {
                _ = self.closed.wait() => Err(InterfaceError::Closed),
                read = reader.read(buffer) => match read? {
                    0 => Err(InterfaceError::Closed),
                    size => Ok(size),
                },
            }
        })
    }

    fn write<'a>(&'a self, packet: &'a [u8]) -> InterfaceFuture<'a, ()> {
        Box::pin(async move {
            let mut writer = self.writer.lock().await;
            let writer = writer.as_mut().ok_or(InterfaceError::Closed)?;
            writer.write_all(packet).await?;
            Ok(())
        })
    }

    fn close(&self) -> InterfaceFuture<'_, ()> {
        Box::pin(async move {
            debug!("Closing TUN device {}", self.name);
            self.closed.trigger();
            self.writer.lock().await.take();
            Ok(())
        })
    }
}
