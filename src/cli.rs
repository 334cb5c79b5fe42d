use argh::FromArgs;

#[derive(FromArgs, PartialEq, Debug)]
/// Mirror historical APT archive snapshots into a content-addressed store
/// and fold them into the temporal package index.
pub struct MirrorArgs {
    /// local directory for the snapshot mirror
    #[argh(positional)]
    pub local_directory: String,
    /// archive to mirror; can be used multiple times (default: debian)
    #[argh(option)]
    pub archive: Vec<String>,
    /// suite to mirror; can be used multiple times (default: unstable)
    #[argh(option)]
    pub suite: Vec<String>,
    /// component to mirror; can be used multiple times (default: main)
    #[argh(option)]
    pub component: Vec<String>,
    /// architecture to mirror; can be used multiple times
    #[argh(option)]
    pub arch: Vec<String>,
    /// timestamp to mirror; either a bare YYYYMMDDTHHMMSSZ value or a
    /// 'begin:end' range where an empty boundary means the earliest/latest
    /// known timestamp; can be used multiple times (default: all known)
    #[argh(option)]
    pub timestamp: Vec<String>,
    /// verify already downloaded blobs, do not fetch
    #[argh(switch)]
    pub check_only: bool,
    /// fold mirrored metadata into the index
    #[argh(switch)]
    pub provision_db: bool,
    /// fold only, skip fetching
    #[argh(switch)]
    pub provision_db_only: bool,
    /// re-fold metadata that carries an ingestion marker
    #[argh(switch)]
    pub ignore_provisioned: bool,
    /// keep partially downloaded .part files on hash mismatch
    #[argh(switch)]
    pub no_clean_part_file: bool,
    /// skip installer image trees
    #[argh(switch)]
    pub skip_installer_files: bool,
    /// display info messages
    #[argh(switch)]
    pub verbose: bool,
    /// display debug messages
    #[argh(switch)]
    pub debug: bool,
}

impl MirrorArgs {
    /// Apply the defaults the driver expects when a dimension is not given.
    pub fn normalize(&mut self) {
        if self.archive.is_empty() {
            self.archive.push("debian".to_string());
        }
        if self.suite.is_empty() {
            self.suite.push("unstable".to_string());
        }
        if self.component.is_empty() {
            self.component.push("main".to_string());
        }
    }
}

#[derive(FromArgs, PartialEq, Debug)]
/// Serve the read-only snapshot index query API.
pub struct ApiArgs {
    /// address to listen on (default: 127.0.0.1:5000)
    #[argh(option, default = "String::from(\"127.0.0.1:5000\")")]
    pub bind: String,
    /// database connection string
    #[argh(option)]
    pub db_pgconn: Option<String>,
    /// display info messages
    #[argh(switch)]
    pub verbose: bool,
    /// display debug messages
    #[argh(switch)]
    pub debug: bool,
}
