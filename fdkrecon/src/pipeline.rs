use std::thread::{self, JoinHandle};

use crossbeam_channel::bounded;
use tracing::{debug, error, info};

use crate::error::{ReconstructionError, Result};
use crate::stage::{Consumer, Producer, Stage, StreamItem};

/// Wires stages together and runs each on a dedicated thread.
///
/// Neighbouring stages are connected by a bounded channel. When a neighbour goes
/// away early, the input side yields the sentinel and the output side refuses
/// further items, so that every thread terminates and [Pipeline::wait] can report
/// the failure.
pub struct Pipeline {
    capacity: usize,
    threads: Vec<(&'static str, JoinHandle<Result<()>>)>,
}

impl Pipeline {
    /// Creates a pipeline whose channels hold up to `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Pipeline {
            capacity: capacity.max(1),
            threads: Vec::new(),
        }
    }

    /// Makes `upstream`'s output the input of `downstream`.
    pub fn connect<P, C>(&self, upstream: &mut P, downstream: &mut C)
    where
        P: Producer,
        C: Consumer<Input = P::Output>,
    {
        let (tx, rx) = bounded::<P::Output>(self.capacity);
        let from = upstream.name();
        let to = downstream.name();

        upstream.set_output_function(Box::new(move |item| {
            let delivered = tx.send(item).is_ok();
            if !delivered {
                debug!(from, to, "downstream stage is gone");
            }
            delivered
        }));
        downstream.set_input_function(Box::new(move || {
            rx.recv().unwrap_or_else(|_| {
                debug!(from, to, "upstream stage is gone, ending stream");
                <P::Output as StreamItem>::sentinel()
            })
        }));
    }

    /// Starts `stage` on its own thread.
    pub fn run<S: Stage>(&mut self, mut stage: S) -> Result<()> {
        let name = stage.name();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                info!(stage = name, "stage started");
                let result = stage.run();
                match &result {
                    Ok(()) => info!(stage = name, "stage finished"),
                    Err(e) => error!(stage = name, error = %e, "stage failed"),
                }
                result
            })
            .map_err(|e| ReconstructionError::stage(name, format!("cannot spawn thread: {e}")))?;
        self.threads.push((name, handle));
        Ok(())
    }

    /// Joins every stage thread.
    ///
    /// # Returns
    /// `Ok(())` if all stages succeeded, otherwise the first error in stage order.
    /// A stage that only stopped because its consumer was gone is reported last,
    /// after the failure that caused it.
    pub fn wait(self) -> Result<()> {
        let mut first_error = None;
        let mut disconnected = None;
        for (name, handle) in self.threads {
            let result = match handle.join() {
                Ok(result) => result,
                Err(_) => Err(ReconstructionError::stage(name, "thread panicked")),
            };
            match result {
                Ok(()) => {}
                Err(e @ ReconstructionError::Disconnected { .. }) => {
                    disconnected.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error.or(disconnected) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{InputFunction, Inlet, Outlet, OutputFunction};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Debug)]
    struct Number(Option<u32>);

    impl StreamItem for Number {
        fn sentinel() -> Self {
            Number(None)
        }

        fn is_sentinel(&self) -> bool {
            self.0.is_none()
        }
    }

    struct Counter {
        upto: u32,
        sent: Arc<AtomicU32>,
        outlet: Outlet<Number>,
    }

    impl Stage for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn run(&mut self) -> Result<()> {
            for n in 0..self.upto {
                self.outlet.push(Number(Some(n)))?;
                self.sent.fetch_add(1, Ordering::Relaxed);
            }
            self.outlet.push(Number::sentinel())
        }
    }

    impl Producer for Counter {
        type Output = Number;

        fn set_output_function(&mut self, output: OutputFunction<Number>) {
            self.outlet.connect(output);
        }
    }

    struct Collector {
        fail_after: Option<usize>,
        inlet: Inlet<Number>,
        seen: Arc<Mutex<Vec<u32>>>,
    }

    impl Stage for Collector {
        fn name(&self) -> &'static str {
            "collector"
        }

        fn run(&mut self) -> Result<()> {
            loop {
                let item = self.inlet.pull()?;
                let Some(n) = item.0 else { return Ok(()) };
                let mut seen = self.seen.lock().unwrap();
                seen.push(n);
                if Some(seen.len()) == self.fail_after {
                    return Err(ReconstructionError::MalformedInput("bad item".into()));
                }
            }
        }
    }

    impl Consumer for Collector {
        type Input = Number;

        fn set_input_function(&mut self, input: InputFunction<Number>) {
            self.inlet.connect(input);
        }
    }

    fn run(upto: u32, fail_after: Option<usize>) -> (Result<()>, Vec<u32>, u32) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sent = Arc::new(AtomicU32::new(0));
        let mut counter = Counter {
            upto,
            sent: Arc::clone(&sent),
            outlet: Outlet::new("counter"),
        };
        let mut collector = Collector {
            fail_after,
            inlet: Inlet::new("collector"),
            seen: Arc::clone(&seen),
        };
        let mut pipeline = Pipeline::new(2);
        pipeline.connect(&mut counter, &mut collector);
        pipeline.run(counter).unwrap();
        pipeline.run(collector).unwrap();
        let result = pipeline.wait();
        let seen = seen.lock().unwrap().clone();
        (result, seen, sent.load(Ordering::Relaxed))
    }

    #[test]
    fn items_arrive_in_order() {
        let (result, seen, sent) = run(20, None);
        assert!(result.is_ok());
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
        assert_eq!(sent, 20);
    }

    #[test]
    fn failing_stage_fails_the_run_without_deadlock() {
        let (result, seen, _) = run(50, Some(3));
        assert!(matches!(result, Err(ReconstructionError::MalformedInput(_))));
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn producer_stops_once_its_consumer_failed() {
        let (result, seen, sent) = run(1_000_000, Some(3));
        // the consumer's error wins over the producer's disconnect
        assert!(matches!(result, Err(ReconstructionError::MalformedInput(_))));
        assert_eq!(seen.len(), 3);
        // at most the items already in the channel plus one refused send
        assert!(sent <= 3 + 2 + 1, "producer kept going: {sent} items sent");
    }
}
