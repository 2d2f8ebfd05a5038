use std::sync::Arc;

use tracing::info;

use quill_messaging::{HandlerRegistry, StreamStore};

use crate::config::WorkerConfig;
use crate::consumer::{ConsumerEngine, ConsumerStats, EngineError};
use crate::dead_letter::{DeadLetterMonitor, MonitorHandle};

/// Handle to a running worker: one consumer engine plus its dead-letter monitor.
pub struct WorkerHandle<S> {
    engine: ConsumerEngine<S>,
    monitor: Option<MonitorHandle>,
}

impl<S> std::fmt::Debug for WorkerHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("engine", &self.engine)
            .field("monitor", &self.monitor)
            .finish()
    }
}

impl<S: StreamStore + 'static> WorkerHandle<S> {
    pub fn engine(&self) -> &ConsumerEngine<S> {
        &self.engine
    }

    pub fn stats(&self) -> ConsumerStats {
        self.engine.stats()
    }

    /// Stop the engine after its in-flight job, then the monitor, and wait for both.
    pub fn shutdown(mut self) {
        self.engine.shutdown();
        if let Some(monitor) = self.monitor.take() {
            monitor.shutdown();
        }
        info!(consumer = %self.engine.config().consumer, "worker stopped");
    }
}

/// Wires a consumer engine and a dead-letter monitor from a `WorkerConfig`.
#[derive(Debug)]
pub struct Worker;

impl Worker {
    /// Start consuming `config.engine.stream` with the handlers in `registry`.
    ///
    /// The store is cloned into the monitor, so pass a shared handle
    /// (typically `Arc<impl StreamStore>`).
    pub fn spawn<S>(
        store: S,
        config: &WorkerConfig,
        registry: Arc<HandlerRegistry>,
    ) -> Result<WorkerHandle<S>, EngineError>
    where
        S: StreamStore + Clone + 'static,
    {
        let engine = ConsumerEngine::with_registry(store.clone(), config.engine.clone(), registry);
        engine.start()?;

        let monitor = DeadLetterMonitor::new(
            store,
            config.engine.dead_letter_stream(),
            config.dead_letter,
        );
        let monitor = match monitor.spawn() {
            Ok(handle) => handle,
            Err(err) => {
                engine.shutdown();
                return Err(EngineError::Spawn(err));
            }
        };

        info!(
            stream = %config.engine.stream,
            group = %config.engine.group,
            consumer = %config.engine.consumer,
            handlers = engine.registry().len(),
            "worker started"
        );
        Ok(WorkerHandle {
            engine,
            monitor: Some(monitor),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use quill_core::{ProjectId, TenantId};
    use quill_messaging::{CorrelationContext, InMemoryStreamStore, JobKind};

    use crate::consumer::EngineState;
    use crate::producer::{ChapterGenerationJob, GENERATION_STREAM, JobOptions, Producer};

    fn config() -> WorkerConfig {
        let mut config = WorkerConfig::from_lookup(|_| None).unwrap();
        config.engine = config.engine.with_block_timeout(Duration::from_millis(20));
        config
    }

    #[test]
    fn worker_processes_published_job_and_shuts_down() {
        let store = InMemoryStreamStore::arc();
        let registry = Arc::new(HandlerRegistry::new());
        let (tx, rx) = std::sync::mpsc::channel();
        registry.register(JobKind::ChapterGeneration, move |_, envelope| {
            let job: ChapterGenerationJob = envelope.decode_payload()?;
            let _ = tx.send(job.chapter_number);
            Ok(())
        });

        let worker = Worker::spawn(store.clone(), &config(), registry).unwrap();
        assert_eq!(worker.engine().state(), EngineState::Running);

        Producer::new(store.clone())
            .publish_chapter_generation(
                &CorrelationContext::new(),
                TenantId::new(),
                ProjectId::new(),
                &ChapterGenerationJob {
                    chapter_id: uuid::Uuid::now_v7(),
                    chapter_number: 3,
                    outline: None,
                    target_words: Some(2500),
                },
                JobOptions::default(),
            )
            .unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 3);

        // The ack lands right after the handler returns.
        let deadline = Instant::now() + Duration::from_secs(5);
        while worker.stats().succeeded == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(worker.stats().succeeded, 1);

        let started = Instant::now();
        worker.shutdown();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(store.len(GENERATION_STREAM).unwrap(), 1);
    }
}
