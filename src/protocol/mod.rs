// Protocol surface (C8) — the three endpoint families spec §4.8 names:
// AAP (inbound JSON-RPC), UIP (streaming run transport), and discovery
// (registry-over-HTTP).

pub mod aap_endpoint;
pub mod discovery_endpoints;
pub mod uip;
