//! PipeWire and WirePlumber probes
//!
//! Screen capture rides on PipeWire streams, so a dead or missing daemon
//! breaks every portal backend at once. These probes check the binaries,
//! their versions, and whether the processes are alive.

use tracing::debug;

use super::{command_available, is_process_running, run_command};
use crate::facts::state::{ComponentFact, ComponentStatus};

/// Probe the PipeWire daemon
pub fn probe_pipewire() -> ComponentFact {
    probe_component("pipewire", "pipewire", "libpipewire")
}

/// Probe the WirePlumber session manager
pub fn probe_wireplumber() -> ComponentFact {
    probe_component("wireplumber", "wireplumber", "libwireplumber")
}

fn probe_component(binary: &str, process: &str, version_marker: &str) -> ComponentFact {
    if !command_available(binary) {
        debug!(binary, "component binary not found");
        return ComponentFact {
            status: ComponentStatus::NotInstalled,
            version: None,
        };
    }

    let version = run_command(binary, &["--version"])
        .and_then(|output| parse_version(&output, version_marker));

    let status = if is_process_running(process) {
        ComponentStatus::Running
    } else {
        // The collector upgrades this to Running when the systemd unit
        // is active (socket-activated daemons may sit idle).
        ComponentStatus::Stopped
    };

    ComponentFact { status, version }
}

/// Extract the version from `--version` output.
///
/// Both daemons print lines like `Compiled with libpipewire 1.0.5`; the
/// version is the last token of the first line naming the library.
fn parse_version(output: &str, marker: &str) -> Option<String> {
    output
        .lines()
        .find(|line| line.contains(marker))?
        .split_whitespace()
        .last()
        .map(std::string::ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pipewire_version() {
        let output = "\
pipewire
Compiled with libpipewire 1.0.5
Linked with libpipewire 1.0.5";
        assert_eq!(parse_version(output, "libpipewire"), Some("1.0.5".to_string()));
    }

    #[test]
    fn test_parse_wireplumber_version() {
        let output = "\
wireplumber
Compiled with libwireplumber 0.5.2
Linked with libwireplumber 0.5.2";
        assert_eq!(
            parse_version(output, "libwireplumber"),
            Some("0.5.2".to_string())
        );
    }

    #[test]
    fn test_parse_version_no_marker() {
        assert_eq!(parse_version("pipewire 1.0.5", "libpipewire"), None);
    }
}
