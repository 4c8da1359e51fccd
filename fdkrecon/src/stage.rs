//! Producer/consumer building blocks of the pipeline
//!
//! A stage pulls items through an input function and pushes results through an
//! output function. Both are plain closures set by the driver before [Stage::run];
//! blocking inside them is how backpressure travels upstream.

use crate::error::{ReconstructionError, Result};

/// An item that can travel between stages.
///
/// Every stream ends with exactly one sentinel, which every stage forwards
/// unchanged before it terminates.
pub trait StreamItem: Send + 'static {
    /// The end-of-stream marker.
    fn sentinel() -> Self;

    fn is_sentinel(&self) -> bool;
}

/// Blocking pull of the next item.
pub type InputFunction<T> = Box<dyn FnMut() -> T + Send>;

/// Blocking push of one item; `false` when nobody is left to receive it.
pub type OutputFunction<T> = Box<dyn FnMut(T) -> bool + Send>;

/// The part of a stage that can be run on its own thread.
pub trait Stage: Send + 'static {
    /// Name used for the thread and in logs.
    fn name(&self) -> &'static str;

    /// Processes items until the sentinel arrives, then forwards it and returns.
    fn run(&mut self) -> Result<()>;
}

/// A stage that consumes items.
pub trait Consumer: Stage {
    type Input: StreamItem;

    fn set_input_function(&mut self, input: InputFunction<Self::Input>);
}

/// A stage that produces items.
pub trait Producer: Stage {
    type Output: StreamItem;

    fn set_output_function(&mut self, output: OutputFunction<Self::Output>);
}

/// Input side of a stage.
pub struct Inlet<T> {
    stage: &'static str,
    function: Option<InputFunction<T>>,
}

impl<T: StreamItem> Inlet<T> {
    pub fn new(stage: &'static str) -> Self {
        Inlet { stage, function: None }
    }

    pub fn connect(&mut self, function: InputFunction<T>) {
        self.function = Some(function);
    }

    /// Pulls the next item, failing if the stage was never wired.
    pub fn pull(&mut self) -> Result<T> {
        match self.function.as_mut() {
            Some(input) => Ok(input()),
            None => Err(ReconstructionError::stage(self.stage, "input function not set")),
        }
    }
}

/// Output side of a stage.
pub struct Outlet<T> {
    stage: &'static str,
    function: Option<OutputFunction<T>>,
}

impl<T: StreamItem> Outlet<T> {
    pub fn new(stage: &'static str) -> Self {
        Outlet { stage, function: None }
    }

    pub fn connect(&mut self, function: OutputFunction<T>) {
        self.function = Some(function);
    }

    /// Pushes one item downstream.
    ///
    /// # Returns
    /// [ReconstructionError::Disconnected] if the consumer has gone away, so the
    /// stage can stop producing.
    pub fn push(&mut self, item: T) -> Result<()> {
        match self.function.as_mut() {
            Some(output) => {
                if output(item) {
                    Ok(())
                } else {
                    Err(ReconstructionError::Disconnected {
                        stage: self.stage.to_string(),
                    })
                }
            }
            None => Err(ReconstructionError::stage(self.stage, "output function not set")),
        }
    }
}
