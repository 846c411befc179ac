//! Canonical topic names.
//!
//! # Topic layout
//!
//! ```text
//! {prefix}/pub/{site}/{line}   ← the gateway PUBLISHES station data here
//! {prefix}/get/{site}/{line}   ← the gateway SUBSCRIBES for inbound commands
//! ```

/// Central authority for the publish / command topic names.
///
/// # Examples
///
/// ```
/// use stationlink_sdk::Topics;
///
/// assert_eq!(Topics::publish("/dxiot/4q", "huaheng", "wuliu"), "/dxiot/4q/pub/huaheng/wuliu");
/// assert_eq!(Topics::command("/dxiot/4q", "huaheng", "wuliu"), "/dxiot/4q/get/huaheng/wuliu");
/// ```
pub struct Topics;

impl Topics {
    /// Topic station data is published on.
    pub fn publish(prefix: &str, site: &str, line: &str) -> String {
        Self::join(prefix, "pub", site, line)
    }

    /// Topic the gateway listens on for inbound commands.
    pub fn command(prefix: &str, site: &str, line: &str) -> String {
        Self::join(prefix, "get", site, line)
    }

    fn join(prefix: &str, direction: &str, site: &str, line: &str) -> String {
        let prefix = prefix.trim_end_matches('/');
        format!("{prefix}/{direction}/{site}/{line}")
    }
}
