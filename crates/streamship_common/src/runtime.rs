//! Runtime trait for abstracting away OS-esque features (spawning, sleeping,
//! randomness, wall-clock time) so that every component can be driven
//! deterministically in tests.

use std::{
    future::Future,
    time::{
        Duration,
        SystemTime,
        UNIX_EPOCH,
    },
};

use rand::rngs::ThreadRng;

/// A handle to a spawned background task. Dropping it does not cancel the
/// task; callers that need cooperative shutdown use the watch-channel based
/// cancellation signal each component already accepts as a constructor
/// argument, matching the "global cancellation token" model in `spec.md` §5.
pub trait SpawnHandle: Send {
    fn shutdown(&mut self);
    fn is_finished(&self) -> bool;
}

pub struct TokioSpawnHandle(pub tokio::task::JoinHandle<()>);

impl SpawnHandle for TokioSpawnHandle {
    fn shutdown(&mut self) {
        self.0.abort();
    }

    fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

pub trait Runtime: Clone + Send + Sync + 'static {
    type Rng: rand::Rng;

    fn spawn(
        &self,
        name: &'static str,
        fut: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle>;

    fn wait(&self, duration: Duration) -> impl Future<Output = ()> + Send;

    fn rng(&self) -> Self::Rng;

    /// Ingest-time fallback used by the tailer/container source when a
    /// record carries no parseable timestamp (`spec.md` §3).
    fn unix_timestamp(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }
}

#[derive(Clone, Default)]
pub struct TokioRuntime;

impl Runtime for TokioRuntime {
    type Rng = ThreadRng;

    fn spawn(
        &self,
        name: &'static str,
        fut: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle> {
        let handle = tokio::task::Builder::new()
            .name(name)
            .spawn(fut)
            .unwrap_or_else(|_| tokio::spawn(fut));
        Box::new(TokioSpawnHandle(handle))
    }

    async fn wait(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn rng(&self) -> Self::Rng {
        rand::thread_rng()
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use rand::{
        rngs::StdRng,
        SeedableRng,
    };

    use super::*;

    /// A runtime for tests: `wait` yields once instead of sleeping in real
    /// time, and the RNG is seeded for reproducibility, mirroring the
    /// teacher's `runtime::testing::TestRuntime` used throughout
    /// `log_streaming`'s own tests.
    #[derive(Clone)]
    pub struct TestRuntime {
        rng_seed: Arc<Mutex<u64>>,
    }

    impl Default for TestRuntime {
        fn default() -> Self {
            Self {
                rng_seed: Arc::new(Mutex::new(0)),
            }
        }
    }

    impl TestRuntime {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl Runtime for TestRuntime {
        type Rng = StdRng;

        fn spawn(
            &self,
            name: &'static str,
            fut: impl Future<Output = ()> + Send + 'static,
        ) -> Box<dyn SpawnHandle> {
            let handle = tokio::task::Builder::new()
                .name(name)
                .spawn(fut)
                .unwrap_or_else(|_| tokio::spawn(fut));
            Box::new(TokioSpawnHandle(handle))
        }

        async fn wait(&self, duration: Duration) {
            // Tests run under `#[tokio::test(start_paused = true)]` where
            // applicable; elsewhere a short real sleep keeps ordering sane
            // without making the suite slow.
            tokio::time::sleep(duration).await;
        }

        fn rng(&self) -> Self::Rng {
            let mut seed = self.rng_seed.lock();
            *seed += 1;
            StdRng::seed_from_u64(*seed)
        }
    }
}
