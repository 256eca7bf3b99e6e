mod config;

use anyhow::Context;
use clap::Parser;
use config::{FileConfig, Overrides, Settings};
use std::os::fd::{AsFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use tapnat_net::{MAX_MTU, MIN_MTU, open_tap};
use tracing_subscriber::EnvFilter;

fn parse_fd(s: &str) -> Result<RawFd, String> {
    let fd: RawFd = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid descriptor number"))?;
    if fd < 0 {
        return Err("descriptor number cannot be negative".to_string());
    }
    Ok(fd)
}

fn parse_mtu(s: &str) -> Result<u32, String> {
    let mtu: u32 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;
    if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
        return Err(format!("MTU must be between {MIN_MTU} and {MAX_MTU}"));
    }
    Ok(mtu)
}

#[derive(Parser, Debug)]
#[command(name = "tapnat")]
#[command(about = "Bridge a tap interface to a user-mode NAT network")]
#[command(version)]
struct Cli {
    /// Already-open tap descriptor inherited from the parent
    #[arg(long, value_parser = parse_fd, conflicts_with = "tap", required_unless_present = "tap")]
    tap_fd: Option<RawFd>,

    /// Name of a tap interface to open
    #[arg(long)]
    tap: Option<String>,

    /// Descriptor whose hangup stops the bridge (negative for none)
    #[arg(long, default_value = "-1", allow_negative_numbers = true)]
    exit_fd: RawFd,

    /// Interface MTU (68-65521)
    #[arg(long, value_parser = parse_mtu)]
    mtu: Option<u32>,

    /// Enable IPv6 (router advertisements, NDP and DNS on fd00::/64)
    #[arg(long)]
    enable_ipv6: bool,

    /// Do not relay traffic addressed to the gateway to the host's loopback
    #[arg(long)]
    disable_host_loopback: bool,

    /// Run this program on the tap descriptor instead of the embedded engine
    #[arg(long)]
    helper: Option<PathBuf>,

    /// Path to configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        // --help and --version
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cli) {
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
    std::process::exit(0);
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let settings = Settings::merge(
        file,
        Overrides {
            mtu: cli.mtu,
            enable_ipv6: cli.enable_ipv6,
            disable_host_loopback: cli.disable_host_loopback,
            helper: cli.helper,
        },
    );

    if cli.exit_fd >= 0 && cli.tap_fd == Some(cli.exit_fd) {
        anyhow::bail!("--tap-fd and --exit-fd must differ");
    }

    let tap = match (cli.tap_fd, &cli.tap) {
        (Some(fd), _) => inherited_fd(fd, "tap")?,
        (None, Some(name)) => {
            open_tap(name).with_context(|| format!("failed to open tap interface {name}"))?
        }
        (None, None) => anyhow::bail!("one of --tap-fd or --tap is required"),
    };
    let exit = if cli.exit_fd >= 0 {
        Some(inherited_fd(cli.exit_fd, "exit")?)
    } else {
        None
    };

    tracing::info!(
        mtu = settings.mtu,
        ipv6 = settings.enable_ipv6,
        host_loopback = settings.host_loopback,
        helper = ?settings.helper,
        exit_fd = exit.is_some(),
        "starting bridge"
    );

    settings
        .backend()
        .run(tap.as_fd(), exit.as_ref().map(|fd| fd.as_fd()))?;
    Ok(())
}

/// Take ownership of a descriptor number handed down by the parent.
fn inherited_fd(fd: RawFd, what: &str) -> anyhow::Result<OwnedFd> {
    use nix::fcntl::{FcntlArg, fcntl};

    fcntl(fd, FcntlArg::F_GETFD)
        .with_context(|| format!("{what} descriptor {fd} is not open"))?;
    // SAFETY: F_GETFD succeeded so `fd` is open, and the parent handed it to
    // this process for exclusive use; nothing else wraps it.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_fd_rejects_negative_and_garbage() {
        assert_eq!(parse_fd("3"), Ok(3));
        assert!(parse_fd("-1").is_err());
        assert!(parse_fd("three").is_err());
    }

    #[test]
    fn parse_mtu_bounds() {
        assert_eq!(parse_mtu("68"), Ok(68));
        assert_eq!(parse_mtu("65521"), Ok(65521));
        assert!(parse_mtu("67").is_err());
        assert!(parse_mtu("65522").is_err());
        assert!(parse_mtu("abc").is_err());
    }

    #[test]
    fn tap_source_is_required() {
        assert!(Cli::try_parse_from(["tapnat"]).is_err());
        assert!(Cli::try_parse_from(["tapnat", "--tap-fd", "3", "--tap", "tap0"]).is_err());
    }

    #[test]
    fn negative_exit_fd_means_none() {
        let cli = Cli::try_parse_from(["tapnat", "--tap-fd", "3", "--exit-fd", "-1"]).unwrap();
        assert_eq!(cli.exit_fd, -1);
        let cli = Cli::try_parse_from(["tapnat", "--tap", "tap0"]).unwrap();
        assert_eq!(cli.exit_fd, -1);
        assert_eq!(cli.tap.as_deref(), Some("tap0"));
    }

    #[test]
    fn flags_parse() {
        let cli = Cli::try_parse_from([
            "tapnat",
            "--tap-fd",
            "5",
            "--exit-fd",
            "6",
            "--mtu",
            "9000",
            "--enable-ipv6",
            "--disable-host-loopback",
            "-c",
            "/etc/tapnat.toml",
        ])
        .unwrap();
        assert_eq!(cli.tap_fd, Some(5));
        assert_eq!(cli.exit_fd, 6);
        assert_eq!(cli.mtu, Some(9000));
        assert!(cli.enable_ipv6);
        assert!(cli.disable_host_loopback);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/tapnat.toml")));
    }

    #[test]
    fn unopened_descriptor_is_rejected() {
        let err = inherited_fd(1_000_000, "tap").unwrap_err();
        assert!(err.to_string().contains("tap descriptor 1000000 is not open"));
    }
}
