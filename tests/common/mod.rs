//! Common test infrastructure shared across integration tests.
//!
//! - [`TestMachine`]: a deterministic toy simulation whose state is a running hash of every
//!   input it was fed.
//! - [`TestUi`]: records everything the session shows.
//! - [`Cluster`]: a host and its clients on one [`MemoryNetwork`], stepped in lock-step from
//!   a single thread.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Once;

use rollback_netplay::{
    BootParams, Config, HostParams, HostUi, JoinParams, LoadingProgress, MemoryNetwork,
    NetplayConfig, NetplayError, PadInput, SaveBuffer, Session, SessionState, SettingsOverlay,
    SimulationDriver,
};
use web_time::Duration;

/// Port the host of a [`Cluster`] listens on.
pub const HOST_PORT: u16 = 7000;

/// Upper bound on lock-step iterations before a wait gives up.
pub const MAX_ITERATIONS: usize = 5_000;

static TRACING: Once = Once::new();

/// Sends `tracing` output to the test harness. Safe to call from every test.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing::subscriber::set_global_default(
            tracing_subscriber::FmtSubscriber::builder()
                .with_max_level(tracing::Level::DEBUG)
                .with_test_writer()
                .finish(),
        );
    });
}

/// Short timers so whole sessions finish in well under a second.
pub fn fast_config() -> NetplayConfig {
    NetplayConfig::lan()
        .with_tick_rate(500.0)
        .with_poll_interval(Duration::from_millis(1))
        .with_connect_timeout(Duration::from_millis(1500))
        .with_close_timeout(Duration::from_millis(200))
}

/// Deterministic toy simulation.
#[derive(Debug, Default)]
pub struct TestMachine {
    pub running: bool,
    pub state: u64,
    pub frames: u32,
    /// Mixed into the local input so players press different buttons.
    pub seed: u32,
    pub inputs: Vec<PadInput>,
    pub loads: usize,
    pub state_loads: usize,
    pub muted: bool,
    pub overlay_applied: Option<bool>,
    pub shut_down: bool,
    /// Reports this format version instead of 1.
    pub version_override: Option<u32>,
    /// Added to the state every frame, making this machine diverge from the others.
    pub drift: u64,
}

impl TestMachine {
    pub fn running(seed: u32) -> Self {
        Self {
            running: true,
            seed,
            ..Self::default()
        }
    }

    fn raw(&self) -> Vec<u8> {
        let mut raw = self.state.to_le_bytes().to_vec();
        raw.extend_from_slice(&self.frames.to_le_bytes());
        raw
    }

    fn restore(&mut self, raw: &[u8]) -> Result<(), NetplayError> {
        if raw.len() != 12 {
            return Err(NetplayError::Snapshot {
                context: format!("expected 12 bytes, got {}", raw.len()),
            });
        }
        let mut state = [0u8; 8];
        state.copy_from_slice(&raw[..8]);
        let mut frames = [0u8; 4];
        frames.copy_from_slice(&raw[8..]);
        self.state = u64::from_le_bytes(state);
        self.frames = u32::from_le_bytes(frames);
        Ok(())
    }
}

impl SimulationDriver<PadInput> for TestMachine {
    fn is_running(&self) -> bool {
        self.running
    }

    fn boot(&mut self, _params: &BootParams) -> Result<(), NetplayError> {
        self.running = true;
        Ok(())
    }

    fn run_frame(&mut self) -> Result<(), NetplayError> {
        for pad in &self.inputs {
            self.state = self
                .state
                .wrapping_mul(0x100_0000_01b3)
                .wrapping_add(u64::from(pad.buttons));
        }
        self.state = self.state.wrapping_add(self.drift);
        self.frames += 1;
        Ok(())
    }

    fn state_version(&self) -> u32 {
        self.version_override.unwrap_or(1)
    }

    fn save_state(&mut self) -> Result<Vec<u8>, NetplayError> {
        Ok(self.raw())
    }

    fn load_state(&mut self, raw: &[u8]) -> Result<(), NetplayError> {
        self.state_loads += 1;
        self.restore(raw)
    }

    fn save_memory_state(&mut self, buffer: &mut SaveBuffer) -> Result<(), NetplayError> {
        let raw = self.raw();
        let data = buffer.data_mut();
        data.clear();
        data.extend_from_slice(&raw);
        Ok(())
    }

    fn load_memory_state(&mut self, buffer: &SaveBuffer) -> Result<(), NetplayError> {
        self.loads += 1;
        self.restore(buffer.as_slice())
    }

    fn frame_number(&self) -> u32 {
        self.frames
    }

    fn set_audio_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    fn set_inputs(&mut self, inputs: &[PadInput]) {
        self.inputs = inputs.to_vec();
    }

    fn read_local_input(&mut self) -> PadInput {
        PadInput {
            buttons: (self.frames / 3 + self.seed) % 16,
        }
    }

    fn apply_settings(&mut self, overlay: Option<&SettingsOverlay>) {
        self.overlay_applied = Some(overlay.is_some());
    }

    fn shutdown(&mut self) {
        self.running = false;
        self.shut_down = true;
    }
}

/// Records what the session shows.
#[derive(Debug, Default)]
pub struct TestUi {
    pub messages: Vec<String>,
    pub errors: Vec<(String, String)>,
    pub loading: Vec<(String, u32, u32)>,
}

impl TestUi {
    pub fn saw_message(&self, needle: &str) -> bool {
        self.messages.iter().any(|m| m.contains(needle))
    }
}

impl HostUi for TestUi {
    fn on_message(&mut self, message: &str) {
        self.messages.push(message.to_owned());
    }

    fn report_error(&mut self, title: &str, message: &str) {
        self.errors.push((title.to_owned(), message.to_owned()));
    }

    fn display_loading(&mut self, progress: &LoadingProgress) {
        self.loading
            .push((progress.message.to_owned(), progress.value, progress.max));
    }

    fn pump_messages(&mut self) {}
}

/// Session parameters for the integration tests.
#[derive(Debug)]
pub struct TestConfig;

impl Config for TestConfig {
    type Input = PadInput;
    type Driver = TestMachine;
    type Ui = TestUi;
}

pub type TestSession = Session<TestConfig>;

pub fn new_session(network: &MemoryNetwork, machine: TestMachine) -> TestSession {
    Session::new(
        fast_config(),
        Box::new(network.clone()),
        machine,
        TestUi::default(),
    )
}

pub fn host_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], HOST_PORT))
}

pub fn join_params(nickname: &str) -> JoinParams {
    JoinParams {
        nickname: nickname.to_owned(),
        host_addr: host_addr(),
        password: String::new(),
    }
}

/// A host and its clients. Index 0 is the host.
pub struct Cluster {
    pub network: MemoryNetwork,
    pub sessions: Vec<TestSession>,
}

impl Cluster {
    /// Starts a host allowing up to `max_players`.
    pub fn host(max_players: usize) -> Self {
        init_tracing();
        let network = MemoryNetwork::new();
        let mut host = new_session(&network, TestMachine::running(0));
        host.start_host(HostParams {
            nickname: "host".to_owned(),
            port: HOST_PORT,
            max_players,
            password: String::new(),
        })
        .expect("host starts");
        Self {
            network,
            sessions: vec![host],
        }
    }

    /// Adds a client that starts joining. Returns its index.
    pub fn join(&mut self, nickname: &str) -> usize {
        let seed = self.sessions.len() as u32;
        let mut client = new_session(&self.network, TestMachine::running(seed));
        client.join(join_params(nickname)).expect("join starts");
        self.sessions.push(client);
        self.sessions.len() - 1
    }

    /// Runs one update of every session.
    pub fn step(&mut self) {
        for session in &mut self.sessions {
            session.update();
        }
    }

    /// Steps until `done` holds, or panics after [`MAX_ITERATIONS`].
    pub fn step_until(&mut self, what: &str, mut done: impl FnMut(&Self) -> bool) {
        for _ in 0..MAX_ITERATIONS {
            if done(self) {
                return;
            }
            self.step();
        }
        panic!(
            "timed out waiting for {what}; states: {:?}",
            self.sessions.iter().map(Session::state).collect::<Vec<_>>()
        );
    }

    /// Steps until every session runs with `num_players` players.
    pub fn settle(&mut self, num_players: usize) {
        self.step_until("every session to run", |cluster| {
            cluster.sessions.iter().all(|s| {
                s.state() == SessionState::Running && s.num_players() == num_players
            })
        });
    }

    /// Steps until every session simulated past `frame`.
    pub fn run_to_frame(&mut self, frame: i32) {
        self.step_until("frames to advance", |cluster| {
            cluster
                .sessions
                .iter()
                .all(|s| s.current_frame().as_i32() > frame)
        });
    }

    pub fn session(&self, index: usize) -> &TestSession {
        &self.sessions[index]
    }

    pub fn session_mut(&mut self, index: usize) -> &mut TestSession {
        &mut self.sessions[index]
    }
}
