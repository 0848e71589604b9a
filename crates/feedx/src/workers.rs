// human

// This is pretty much across the whole world of feedx
// anyhowwwww.... it's useful!
use anyhow::Result;
use tokio::task::JoinHandle;

/// 🏗️ A background worker, that does work. duh.
///
/// Two of them exist: the coalescer worker (drains analytics into the metrics sink) and
/// the feed worker (turns raw batches into ordered feeds). Both own their state outright
/// and talk to the world through channels.
pub trait Worker {
    /// 🚀 Start the worker. Returns a JoinHandle because we trust
    /// but verify. Mostly verify.
    fn start(self) -> JoinHandle<Result<()>>;
}
