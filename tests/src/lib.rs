// End-to-end test infrastructure for the conscience daemon.
//
// Spawns a real daemon task on an ephemeral TCP port and drives it
// through the SDK client, the same way external tooling would.

pub mod test_harness;

pub use test_harness::TestDaemon;
