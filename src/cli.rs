//! Command-line argument surface for the `tarfs` binary.

use std::path::PathBuf;

use clap::Parser;

use crate::fs::Options;
use crate::store::Compression;

/// Mount a GNU tar archive as a read/write directory tree.
#[derive(Parser, Debug)]
#[command(name = "tarfs", version, about)]
pub struct Args {
    /// Archive file.
    #[arg(value_name = "ARCHIVE")]
    pub archive: PathBuf,

    /// Archive file is gzipped.
    #[arg(short = 'z', long)]
    pub gzip: bool,

    /// Archive file is bzip2'd.
    #[arg(short = 'j', long, conflicts_with = "gzip")]
    pub bzip2: bool,

    /// Start read-only.
    #[arg(short = 'r', long)]
    pub readonly: bool,

    /// Start writable (default).
    #[arg(short = 'w', long, conflicts_with = "readonly")]
    pub writable: bool,

    /// Start volatile (writable but never synced back).
    #[arg(short = 'v', long = "volatile")]
    pub volatile: bool,

    /// Create the archive file if it is not there.
    #[arg(short = 'c', long)]
    pub create: bool,

    /// Parse the archive in a separate thread (avoids startup timeouts).
    #[arg(short = 't', long = "no-timeout")]
    pub no_timeout: bool,

    /// Sync cached data back every INTERVAL seconds.
    #[arg(short = 's', long = "sync", value_name = "INTERVAL")]
    pub interval: Option<u64>,

    /// Print debug output to FILE.
    #[arg(short = 'D', long = "debug", value_name = "FILE")]
    pub debug: Option<PathBuf>,
}

impl Args {
    pub fn to_options(&self) -> Options {
        let mut opts = Options::new(&self.archive);
        opts.create = self.create;
        opts.readonly = self.readonly && !self.volatile;
        opts.volatile = self.volatile;
        opts.compress = if self.bzip2 {
            Compression::Bzip2
        } else if self.gzip {
            Compression::Gzip
        } else {
            Compression::None
        };
        opts.threaded = self.no_timeout;
        opts.interval = self.interval;
        opts
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("tarfs").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn archive_argument_is_required() {
        assert!(Args::try_parse_from(["tarfs"]).is_err());
    }

    #[test]
    fn defaults_are_plain_writable() {
        let opts = parse(&["a.tar"]).to_options();
        assert!(!opts.readonly && !opts.volatile && !opts.create && !opts.threaded);
        assert_eq!(opts.compress, Compression::None);
        assert_eq!(opts.interval, None);
    }

    #[test]
    fn compression_and_mode_flags() {
        let opts = parse(&["-z", "-r", "a.tar.gz"]).to_options();
        assert_eq!(opts.compress, Compression::Gzip);
        assert!(opts.readonly);

        let opts = parse(&["--bzip2", "--volatile", "a.tar.bz2"]).to_options();
        assert_eq!(opts.compress, Compression::Bzip2);
        assert!(opts.volatile && !opts.readonly);
    }

    #[test]
    fn sync_interval_and_threaded_ingest() {
        let opts = parse(&["-t", "--sync", "30", "a.tar"]).to_options();
        assert!(opts.threaded);
        assert_eq!(opts.interval, Some(30));
    }

    #[test]
    fn conflicting_compressions_are_rejected() {
        assert!(Args::try_parse_from(["tarfs", "-z", "-j", "a.tar"]).is_err());
    }
}
