//! Shared fixture: a runtime wired to the simulated transport, with handles
//! into the backing device and the constructed connector.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lantern_core::LanternConfig;
use lantern_link::{Connector, ConnectorKind, SimConnector, SimDevice};
use lantern_runtime::{ConnectorFactory, ControllerEngine, NullEngine, Runtime, RuntimeError};

pub struct SimHarness {
    pub runtime: Runtime,
    pub device: Arc<SimDevice>,
    connector: Arc<Mutex<Option<Arc<SimConnector>>>>,
    factory_calls: Arc<AtomicUsize>,
}

impl SimHarness {
    pub fn new() -> Self {
        Self::with_config(LanternConfig::default())
    }

    pub fn with_config(config: LanternConfig) -> Self {
        Self::build(config, Arc::new(NullEngine))
    }

    pub fn with_engine(engine: Arc<dyn ControllerEngine>) -> Self {
        Self::build(LanternConfig::default(), engine)
    }

    fn build(config: LanternConfig, engine: Arc<dyn ControllerEngine>) -> Self {
        let device = SimDevice::with_defaults();
        let connector: Arc<Mutex<Option<Arc<SimConnector>>>> = Arc::new(Mutex::new(None));
        let factory_calls = Arc::new(AtomicUsize::new(0));

        let factory: ConnectorFactory = {
            let device = device.clone();
            let slot = connector.clone();
            let calls = factory_calls.clone();
            Arc::new(move |kind, config, signals| {
                calls.fetch_add(1, Ordering::SeqCst);
                match kind {
                    ConnectorKind::Simulated => {
                        let built = Arc::new(SimConnector::new(device.clone(), config, signals));
                        *slot.lock().unwrap() = Some(built.clone());
                        Ok(built as Arc<dyn Connector>)
                    }
                    other => Err(RuntimeError::ConstructionFailed(format!(
                        "no backend for {other}"
                    ))),
                }
            })
        };

        let runtime = Runtime::new(config, engine, factory);
        runtime.set_connector(Some(ConnectorKind::Simulated));
        Self {
            runtime,
            device,
            connector,
            factory_calls,
        }
    }

    pub async fn connect(&self) {
        self.runtime.select(vec![], None).await.unwrap();
        self.runtime.connect(None).await.unwrap();
    }

    /// The connector the factory most recently built. Panics if no command
    /// has drained yet.
    pub fn connector(&self) -> Arc<SimConnector> {
        self.connector
            .lock()
            .unwrap()
            .clone()
            .expect("no connector constructed yet")
    }

    pub fn factory_calls(&self) -> usize {
        self.factory_calls.load(Ordering::SeqCst)
    }

    /// Let the signal pump catch up, then discard everything already on the
    /// given event receiver.
    pub async fn settle(
        &self,
        events: &mut tokio::sync::broadcast::Receiver<lantern_runtime::RuntimeEvent>,
    ) {
        tokio::time::sleep(Duration::from_millis(20)).await;
        while events.try_recv().is_ok() {}
    }
}

/// Wait for an event matching the predicate, discarding everything else.
pub async fn wait_for_event<F>(
    events: &mut tokio::sync::broadcast::Receiver<lantern_runtime::RuntimeEvent>,
    timeout: Duration,
    mut pred: F,
) -> anyhow::Result<lantern_runtime::RuntimeEvent>
where
    F: FnMut(&lantern_runtime::RuntimeEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Ok(event)) if pred(&event) => return Ok(event),
            Ok(Ok(_)) => continue,
            Ok(Err(e)) => anyhow::bail!("event bus closed: {e}"),
            Err(_) => anyhow::bail!("event not seen within {timeout:?}"),
        }
    }
}
