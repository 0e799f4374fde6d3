use std::{
    fs::File,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};

use clap::Parser;
use shoal::{
    config::{COMMON_FILE_NAME, ROSTER_FILE_NAME},
    store, Common, PeerId, Roster, Session, SessionStatus,
};
use tracing_subscriber::EnvFilter;

/// A peer process for a cooperative file-sharing cohort.
///
/// Reads `Common.cfg` and `PeerInfo.cfg` from the root directory, then trades
/// pieces with the rest of the roster until every peer holds the complete
/// file.
#[derive(Debug, Parser)]
struct Args {
    /// Roster id of this peer.
    peer_id: u32,

    /// Directory holding the two configuration files; the per-peer working
    /// directory is created underneath it.
    #[clap(long, default_value = ".")]
    root: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(SessionStatus::Finished) => ExitCode::SUCCESS,
        Ok(status) => {
            eprintln!("peer exited early: {status:?}");
            ExitCode::FAILURE
        }
        Err(error) => {
            eprintln!("{error}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<SessionStatus, Box<dyn std::error::Error>> {
    let peer_id = PeerId::new(args.peer_id);
    let common = Common::load(args.root.join(COMMON_FILE_NAME))?;
    let roster = Roster::load(args.root.join(ROSTER_FILE_NAME))?;
    if roster.get(peer_id).is_none() {
        return Err(shoal::ConfigError::UnknownPeer(peer_id).into());
    }

    let workdir = store::prepare_working_dir(&args.root, peer_id, &common.file_name)?;
    init_logging(&workdir, peer_id)?;
    tracing::info!(
        "Peer {peer_id} starting: {} pieces of {} bytes, roster of {} peers.",
        common.total_pieces(),
        common.piece_size,
        roster.len()
    );

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let mut session = Session::start(common, roster, peer_id, workdir)?;
        Ok(session.wait().await)
    })
}

fn init_logging(workdir: &Path, peer_id: PeerId) -> std::io::Result<()> {
    let file = File::create(workdir.join(format!("log_peer_{peer_id}.log")))?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(false)
        .with_writer(Arc::new(file))
        .init();
    Ok(())
}
