//! Wire protocol: dual-format frame decoding and reply encoding.
//!
//! FerroDB speaks two framings over the same TCP port and the same command
//! grammar: a RESP-style array form for programmatic clients, and a
//! newline-terminated inline form for interactive ones like `nc`/`telnet`.
//! Format is tracked per request, not per connection, so a client can mix
//! both within one session.

pub mod codec;
