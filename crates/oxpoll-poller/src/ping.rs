//! Reachability self-check: invoke the system `ping` once and parse its
//! summary line. Two grammars are recognized:
//!
//! ```text
//! rtt min/avg/max/mdev = 0.032/0.032/0.032/0.000 ms
//! round-trip min/avg/max = 0.088/0.088/0.088 ms
//! ```

use std::time::Duration;
use tokio::process::Command;

/// Average round-trip in milliseconds and whether the output parsed.
/// Anything unrecognized yields `(0, false)`.
pub fn parse_ping(output: &str) -> (f64, bool) {
    for line in output.lines() {
        if !line.contains("min/avg/max") {
            continue;
        }
        let Some((_, stats)) = line.split_once('=') else {
            continue;
        };
        let stats = stats.trim().trim_end_matches("ms").trim();
        let fields: Vec<&str> = stats.split('/').collect();
        if fields.len() < 3 {
            continue;
        }
        if let Ok(avg) = fields[1].trim().parse::<f64>() {
            return (avg, true);
        }
    }
    (0.0, false)
}

/// Pings the remote host once with a short deadline.
pub async fn ping_remote(host: &str, timeout: Duration) -> (f64, bool) {
    let result = tokio::time::timeout(
        timeout,
        Command::new("ping")
            .args(["-c", "1", "-n", "-W", "2", host])
            .output(),
    )
    .await;

    match result {
        Ok(Ok(output)) => parse_ping(&String::from_utf8_lossy(&output.stdout)),
        Ok(Err(e)) => {
            tracing::debug!(host, error = %e, "Ping invocation failed");
            (0.0, false)
        }
        Err(_) => {
            tracing::debug!(host, "Ping timed out");
            (0.0, false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_grammar_parses() {
        let out = "PING 127.0.0.1 (127.0.0.1) 56(84) bytes of data.\n\n\
            --- 127.0.0.1 ping statistics ---\n\
            1 packets transmitted, 1 received, 0% packet loss, time 0ms\n\
            rtt min/avg/max/mdev = 0.032/0.032/0.032/0.000 ms";
        assert_eq!(parse_ping(out), (0.032, true));
    }

    #[test]
    fn busybox_grammar_parses() {
        let out = "PING 127.0.0.1 (127.0.0.1): 56 data bytes\n\n\
            --- 127.0.0.1 ping statistics ---\n\
            1 packets transmitted, 1 packets received, 0% packet loss\n\
            round-trip min/avg/max = 0.088/0.088/0.088 ms";
        assert_eq!(parse_ping(out), (0.088, true));
    }

    #[test]
    fn unrecognized_output_is_not_ok() {
        assert_eq!(parse_ping("foo"), (0.0, false));
        assert_eq!(parse_ping(""), (0.0, false));
        assert_eq!(parse_ping("min/avg/max but no equals"), (0.0, false));
    }
}
