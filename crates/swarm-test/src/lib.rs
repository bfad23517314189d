//! Shared fixtures for the swarmstore end-to-end tests.

use std::sync::Arc;

use swarm_common::{LogicalClock, PeerId, StoreConfig};
use swarm_net::{Hub, HubNetwork};
use swarm_record::{FieldType, TableDescriptor};
use swarm_store::{ChunkMode, NetTable, TableRegistry};

/// A consensus heartbeat period short enough for tests.
pub const TEST_HEARTBEAT_MS: u64 = 10;

/// Installs a `RUST_LOG`-driven subscriber. Call at the top of a test
/// when chasing a failure; repeated calls are fine.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One in-process store peer: hub, clock, registry, and one table.
pub struct TestPeer {
    /// The peer's address.
    pub peer: PeerId,
    /// The peer's hub.
    pub hub: Arc<Hub>,
    /// The peer's logical clock.
    pub clock: Arc<LogicalClock>,
    /// The peer's table registry (kept alive for routing).
    pub registry: Arc<TableRegistry>,
    /// The test table.
    pub table: Arc<NetTable>,
}

/// Builds the shared test table descriptor: one int32 field.
#[must_use]
pub fn test_descriptor() -> Arc<TableDescriptor> {
    TableDescriptor::new("records")
        .with_field("field0", FieldType::Int32)
        .build()
}

/// Spins up one peer attached to `network`.
#[must_use]
pub fn spawn_peer(network: &Arc<HubNetwork>, address: &str, mode: ChunkMode) -> TestPeer {
    let peer = PeerId::new(address);
    let hub = Hub::create(network, peer.clone());
    let clock = Arc::new(LogicalClock::new());
    let registry = TableRegistry::new(&hub);
    let table = NetTable::with_heartbeat_period_ms(
        test_descriptor(),
        mode,
        Arc::clone(&hub),
        Arc::clone(&clock),
        &StoreConfig::new(address),
        TEST_HEARTBEAT_MS,
    );
    registry.add_table(Arc::clone(&table));
    TestPeer {
        peer,
        hub,
        clock,
        registry,
        table,
    }
}
