//! The VPN engine: owns the shared peer state and the workers that move packets.
//!
//! An engine is started once, either as a plain daemon or as an exit node, and stopped once.
//! Stopping is final: a stopped engine cannot be started again.

use std::{
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use ipnet::Ipv4Net;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinSet,
};
use tracing::{debug, info, warn};

use crate::config::VpnSettings;

use super::{
    actors::{
        announcer::Announcer, control_handler::ControlHandler, dispatcher::Dispatcher,
        forwarder::Forwarder, injector::Injector, Actor,
    },
    error::DaemonError,
    exit_node::{self, CommandRunner, SystemCommandRunner},
    exit_select::{ExitSelector, FirstAvailable},
    interface::{self, VirtualInterface},
    overlay::{InboundMessage, OverlayAddress, Transport},
    protocol::{self, ControlMessage, PeerAnnouncement},
    registry::{PeerRecord, PeerRegistry},
    routes::RouteTable,
    shutdown::Shutdown,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Stopped,
}

struct EngineState {
    phase: Phase,
    interface: Option<Arc<dyn VirtualInterface>>,
    workers: JoinSet<()>,
}

pub struct Engine<T> {
    settings: VpnSettings,
    transport: Arc<T>,
    registry: Arc<PeerRegistry>,
    routes: Arc<RouteTable>,
    selector: Arc<dyn ExitSelector>,
    runner: Arc<dyn CommandRunner>,
    discovery: OverlayAddress,
    exit_mode: Arc<AtomicBool>,
    shutdown: Shutdown,
    state: Mutex<EngineState>,
}

impl<T: Transport> Engine<T> {
    pub fn new(settings: VpnSettings, transport: Arc<T>, discovery: OverlayAddress) -> Self {
        Self {
            settings,
            transport,
            registry: Arc::new(PeerRegistry::new()),
            routes: Arc::new(RouteTable::new()),
            selector: Arc::new(FirstAvailable),
            runner: Arc::new(SystemCommandRunner),
            discovery,
            exit_mode: Arc::new(AtomicBool::new(false)),
            shutdown: Shutdown::new(),
            state: Mutex::new(EngineState {
                phase: Phase::Idle,
                interface: None,
                workers: JoinSet::new(),
            }),
        }
    }

    /// Replaces the exit-node selection strategy.
    pub fn with_selector(mut self, selector: Arc<dyn ExitSelector>) -> Self {
        self.selector = selector;
        self
    }

    /// Replaces how exit-node bootstrap commands are executed.
    pub fn with_command_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Starts as a regular participant.
    pub async fn start_daemon(
        &self,
        inbound: mpsc::Receiver<InboundMessage>,
    ) -> Result<(), DaemonError> {
        let interface = self.open_interface();
        self.launch(interface, inbound, false).await
    }

    /// Starts as an exit node, bridging the virtual subnet to the Internet.
    pub async fn start_exit_node(
        &self,
        inbound: mpsc::Receiver<InboundMessage>,
    ) -> Result<(), DaemonError> {
        let interface = self.open_interface();
        self.launch(interface, inbound, true).await
    }

    fn open_interface(&self) -> Arc<dyn VirtualInterface> {
        interface::open(
            &self.settings.interface_name,
            self.settings.subnet,
            self.settings.self_ip(),
            self.settings.mtu,
        )
    }

    /// Spawns the workers on `interface`. In exit mode the host is configured for forwarding
    /// before this node announces itself; if that fails, everything is torn down again.
    pub(crate) async fn launch(
        &self,
        interface: Arc<dyn VirtualInterface>,
        inbound: mpsc::Receiver<InboundMessage>,
        as_exit_node: bool,
    ) -> Result<(), DaemonError> {
        let mut state = self.state.lock().await;
        match state.phase {
            Phase::Idle => {}
            Phase::Running => return Err(DaemonError::AlreadyRunning),
            Phase::Stopped => return Err(DaemonError::Stopped),
        }
        self.exit_mode.store(as_exit_node, Ordering::Release);
        state.interface = Some(interface.clone());
        state.phase = Phase::Running;

        let injector = Injector::new(interface.clone());
        let control_handler = ControlHandler::new(
            self.transport.clone(),
            self.registry.clone(),
            self.routes.clone(),
        );
        let dispatcher = Dispatcher::new(
            inbound,
            control_handler.get_addr(),
            Some(injector.get_addr()),
        );
        let forwarder = Forwarder::new(
            interface.clone(),
            self.transport.clone(),
            self.routes.clone(),
            self.registry.clone(),
            self.selector.clone(),
            self.settings.subnet,
            self.exit_mode.clone(),
        );
        state.workers.spawn(injector.run(self.shutdown.clone()));
        state.workers.spawn(control_handler.run(self.shutdown.clone()));
        state.workers.spawn(dispatcher.run(self.shutdown.clone()));
        state.workers.spawn(forwarder.run(self.shutdown.clone()));

        if as_exit_node {
            let bootstrap =
                exit_node::bootstrap(self.runner.as_ref(), self.settings.subnet, interface.name())
                    .await;
            if let Err(error) = bootstrap {
                self.tear_down(&mut state).await;
                return Err(error.into());
            }
        }

        let announcement = PeerAnnouncement::new(self.settings.self_ip(), as_exit_node);
        let announcer = Announcer::new(
            self.transport.clone(),
            self.registry.clone(),
            self.discovery.clone(),
            announcement,
        );
        state.workers.spawn(announcer.run(self.shutdown.clone()));
        info!(
            "VPN engine started on {} with IP {} ({})",
            interface.name(),
            self.settings.self_ip(),
            if as_exit_node { "exit node" } else { "daemon" }
        );
        Ok(())
    }

    /// Stops every worker and closes the interface. Stopping twice is harmless.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if state.phase == Phase::Running {
            self.tear_down(&mut state).await;
            info!("VPN engine stopped");
        }
        state.phase = Phase::Stopped;
    }

    async fn tear_down(&self, state: &mut EngineState) {
        self.shutdown.trigger();
        if let Some(interface) = state.interface.take() {
            if let Err(error) = interface.close().await {
                warn!("Failed to close interface: {}", error);
            }
        }
        while let Some(result) = state.workers.join_next().await {
            if let Err(error) = result {
                warn!("Worker ended abnormally: {}", error);
            }
        }
        state.phase = Phase::Stopped;
    }

    /// Completes once the engine shuts down, including when a worker stops it on its own.
    pub async fn stopped(&self) {
        self.shutdown.wait().await
    }

    /// Forgets the route to a peer's virtual address. Returns the peer it pointed to.
    pub fn remove_peer_route(&self, virtual_ip: Ipv4Addr) -> Option<OverlayAddress> {
        self.routes.remove_host(virtual_ip)
    }

    /// Records an operator-supplied peer and pings it, so a live peer comes online.
    pub async fn add_manual_peer(&self, address: &OverlayAddress) {
        self.registry.add_manual(address);
        let ping = ControlMessage::Ping;
        if let Err(error) = protocol::send_control(self.transport.as_ref(), address, &ping).await {
            debug!("Failed to ping {}: {}", address.short(), error);
        }
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.registry.snapshot()
    }

    pub fn exit_nodes(&self) -> Vec<PeerRecord> {
        self.registry.find_exit_nodes()
    }

    pub fn routes(&self) -> Vec<(Ipv4Net, OverlayAddress)> {
        self.routes.snapshot()
    }

    pub fn self_ip(&self) -> Ipv4Addr {
        self.settings.self_ip()
    }

    pub fn is_exit_node(&self) -> bool {
        self.exit_mode.load(Ordering::Acquire)
    }

    /// Writes a packet to the interface as if it had arrived from the overlay.
    pub async fn inject_packet(&self, packet: Bytes) -> Result<(), DaemonError> {
        let interface = self.state.lock().await.interface.clone();
        match interface {
            Some(interface) => Ok(interface.write(&packet).await?),
            None => Err(DaemonError::Stopped),
        }
    }
}
