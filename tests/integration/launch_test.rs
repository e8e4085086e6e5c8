//! Integration tests for launch orchestration.
//!
//! These tests are implemented in:
//! `crates/scredis-runtime/tests/launch_test.rs`
//!
//! Covered scenarios:
//! - `host_network_launch_touches_no_network_state`: no flags, host network, no lease
//! - `specific_address_is_leased_and_released`: `-i 10.0.5.22 -c "port 6381"`
//! - `automatic_address_takes_lowest_free_id`: `--bridge` leases the lowest free id
//! - `invalid_address_fails_before_acquiring_anything`: `.1`, `.255`, foreign subnet, garbage
//! - `address_in_use_rolls_back_rootfs`: a taken id fails after export and cleans up
//! - `create_failure_releases_lease_and_rootfs`: rollback after runtime creation fails
//! - `start_failure_destroys_container`: rollback after the init stage reports failure
//! - `teardown_failure_turns_clean_exit_into_failure`: exit 0 becomes 1
//! - `workload_exit_code_is_propagated` / `signal_death_maps_to_128_plus_signo`
