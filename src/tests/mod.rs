// Test modules for upnp-nat
// Shared fixtures live in `support`

mod config_tests;
mod support;
