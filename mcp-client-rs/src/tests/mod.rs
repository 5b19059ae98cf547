//! Unit tests for the MCP client
//!
//! Client and pool behaviour is exercised against in-memory tool servers;
//! the HTTP transport against a WireMock server.

pub mod pool_tests;
