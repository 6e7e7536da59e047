//! `pv-export` command line.

use crate::config::ExportConfig;
use crate::job::{ExportFilter, ExportOptions, ExportStatus, Phase};
use crate::orchestrator::{ExportOrchestrator, ExportPorts};
use crate::ports::{
    ArchiveDirLister, InMemoryLister, ItemLister, MountTableLister, OsSpaceGauge,
    TracingEventSink, VolumeLister,
};
use crate::preflight::format_bytes;
use crate::restore::restore_export;
use anyhow::{anyhow, bail, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Command line of the `pv-export` binary.
#[derive(Parser)]
#[command(name = "pv-export")]
#[command(about = "PostVault archive export tool", long_about = None)]
pub struct Cli {
    /// Config file (.toml or .json).
    #[arg(short, long, env = "PV_EXPORT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the crash-state snapshot location.
    #[arg(long)]
    pub state_path: Option<PathBuf>,

    /// Subcommand.
    #[command(subcommand)]
    pub command: Command,
}

/// `pv-export` subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Export an archive directory.
    Export {
        /// Archive root holding one directory per post.
        #[arg(short, long)]
        archive: PathBuf,
        /// Destination directory.
        #[arg(short, long)]
        dest: PathBuf,
        /// Mount point of the target volume.
        #[arg(short, long)]
        mount_point: Option<PathBuf>,
        /// Earliest post date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<NaiveDate>,
        /// Latest post date (YYYY-MM-DD).
        #[arg(long)]
        until: Option<NaiveDate>,
        /// Only these authors (repeatable).
        #[arg(long = "author")]
        authors: Vec<String>,
        /// Free-text filter over post text and author.
        #[arg(short, long)]
        query: Option<String>,
        /// Encrypt the export.
        #[arg(long)]
        encrypt: bool,
        /// Password for --encrypt.
        #[arg(long, env = "PV_EXPORT_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        /// Also write <dest>.zip.
        #[arg(long)]
        bundle: bool,
    },
    /// Decrypt an encrypted export into a directory.
    Restore {
        /// Encrypted export directory.
        #[arg(short, long)]
        src: PathBuf,
        /// Output directory.
        #[arg(short, long)]
        out: PathBuf,
        /// Export password.
        #[arg(long, env = "PV_EXPORT_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Show the last recorded export.
    Status,
    /// List mounted volumes.
    Volumes,
}

impl Cli {
    fn load_config(&self) -> Result<ExportConfig> {
        let mut config = match &self.config {
            Some(path) => ExportConfig::from_file(path)?,
            None => ExportConfig::default(),
        };
        if let Some(state_path) = &self.state_path {
            config.state_path = state_path.clone();
        }
        Ok(config)
    }

    fn orchestrator(&self, lister: Arc<dyn ItemLister>) -> Result<ExportOrchestrator> {
        Ok(ExportOrchestrator::new(
            self.load_config()?,
            ExportPorts {
                lister,
                events: Arc::new(TracingEventSink),
                space: Arc::new(OsSpaceGauge),
                volumes: Arc::new(MountTableLister::default()),
            },
        ))
    }

    /// Executes the parsed command.
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Export {
                ref archive,
                ref dest,
                ref mount_point,
                since,
                until,
                ref authors,
                ref query,
                encrypt,
                ref password,
                bundle,
            } => {
                let options = ExportOptions {
                    dest_path: dest.clone(),
                    mount_point: mount_point.clone(),
                    filter: ExportFilter {
                        since,
                        until,
                        authors: authors.clone(),
                        query: query.clone(),
                    },
                    encrypt,
                    // The env password only applies to encrypted exports.
                    password: if encrypt { password.clone() } else { None },
                    bundle,
                };
                self.export(archive.clone(), options).await
            }
            Command::Restore {
                ref src,
                ref out,
                ref password,
            } => self.restore(src.clone(), out.clone(), password.clone()).await,
            Command::Status => self.status(),
            Command::Volumes => self.volumes(),
        }
    }

    async fn export(&self, archive: PathBuf, options: ExportOptions) -> Result<()> {
        let orchestrator = self.orchestrator(Arc::new(ArchiveDirLister::new(archive)))?;
        orchestrator.recover_on_startup()?;
        orchestrator.start_export(options).await?;

        let status = tokio::select! {
            status = orchestrator.wait() => status?,
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("interrupted, cancelling export");
                orchestrator.shutdown().await;
                orchestrator.status()?
            }
        };

        print_status(&status);
        match status.phase {
            Phase::Completed => Ok(()),
            Phase::Cancelled => bail!("Export cancelled"),
            _ => bail!(
                "Export failed: {}",
                status.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }

    async fn restore(&self, src: PathBuf, out: PathBuf, password: Option<String>) -> Result<()> {
        let password = Zeroizing::new(
            password.ok_or_else(|| anyhow!("a password is required (set PV_EXPORT_PASSWORD)"))?,
        );
        let report = tokio::task::spawn_blocking(move || {
            restore_export(&src, password.as_bytes(), &out)
        })
        .await??;
        println!("Restored files: {}", report.files);
        println!("Restored bytes: {}", format_bytes(report.bytes));
        if report.data_restored {
            println!("Restored tweets-data.json");
        }
        Ok(())
    }

    fn status(&self) -> Result<()> {
        let orchestrator = self.orchestrator(Arc::new(InMemoryLister::default()))?;
        match orchestrator.recover_on_startup()? {
            Some(status) => print_status(&status),
            None => println!("No export recorded"),
        }
        Ok(())
    }

    fn volumes(&self) -> Result<()> {
        let volumes = MountTableLister::default().list_volumes()?;
        if volumes.is_empty() {
            println!("No volumes found");
        }
        for v in volumes {
            println!("{:<30} {:<10} {}", v.mount_point.display(), v.fs_type, v.device);
        }
        Ok(())
    }
}

fn print_status(status: &ExportStatus) {
    println!("Export:      {}", status.export_id);
    println!("Destination: {}", status.dest_path.display());
    println!("Phase:       {}", status.phase);
    println!("Items:       {}/{}", status.exported, status.total);
    println!("Written:     {}", format_bytes(status.bytes_written));
    println!("Started:     {}", status.started_at.to_rfc3339());
    if let Some(bundle) = &status.bundle_path {
        println!("Bundle:      {}", bundle.display());
    }
    if let Some(error) = &status.error {
        println!("Error:       {}", error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_export_subcommand() {
        let cli = Cli::parse_from([
            "pv-export",
            "export",
            "--archive",
            "/srv/archive",
            "--dest",
            "/media/usb/export",
            "--since",
            "2024-01-01",
            "--author",
            "alice",
            "--author",
            "bob",
            "--encrypt",
            "--password",
            "pw",
            "--bundle",
        ]);
        match cli.command {
            Command::Export {
                dest,
                since,
                authors,
                encrypt,
                password,
                bundle,
                ..
            } => {
                assert_eq!(dest, PathBuf::from("/media/usb/export"));
                assert_eq!(since, NaiveDate::from_ymd_opt(2024, 1, 1));
                assert_eq!(authors, vec!["alice".to_string(), "bob".to_string()]);
                assert!(encrypt && bundle);
                assert_eq!(password.as_deref(), Some("pw"));
            }
            _ => panic!("Expected Export command"),
        }
    }

    #[test]
    fn test_cli_restore_subcommand() {
        let cli = Cli::parse_from(["pv-export", "restore", "--src", "/a", "--out", "/b", "--password", "x"]);
        match cli.command {
            Command::Restore { src, out, .. } => {
                assert_eq!(src, PathBuf::from("/a"));
                assert_eq!(out, PathBuf::from("/b"));
            }
            _ => panic!("Expected Restore command"),
        }
    }

    #[test]
    fn test_cli_status_and_volumes() {
        assert!(matches!(
            Cli::parse_from(["pv-export", "status"]).command,
            Command::Status
        ));
        assert!(matches!(
            Cli::parse_from(["pv-export", "volumes"]).command,
            Command::Volumes
        ));
    }

    #[test]
    fn test_state_path_override() {
        let cli = Cli::parse_from(["pv-export", "--state-path", "/tmp/pv.json", "status"]);
        assert_eq!(cli.load_config().unwrap().state_path, PathBuf::from("/tmp/pv.json"));
    }

    #[test]
    fn test_invalid_date_rejected() {
        assert!(Cli::try_parse_from([
            "pv-export", "export", "--archive", "a", "--dest", "b", "--since", "yesterday"
        ])
        .is_err());
    }
}
