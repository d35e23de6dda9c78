//! Buffered, typed event logging.
//!
//! A [`Registry`] maps names to loggers. Each [`Logger`] accumulates timestamped events and
//! hands them in batches to an action supplied when the logger was registered. Loggers are
//! cheap to clone, and all clones share one buffer; the final clone to drop flushes any
//! remaining events and then presents an empty batch, which signals the end of the stream.

#![forbid(missing_docs)]

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// The capacity at which a logger hands its buffer to its action.
const BUFFER_CAPACITY: usize = 1024;

/// A registry binding names to typed loggers.
pub struct Registry {
    /// Instant against which all logged events are timestamped.
    time: Instant,
    /// Map from names to typed loggers, and their flush hooks.
    map: HashMap<String, (Box<dyn Any + Send + Sync>, Box<dyn Flush + Send + Sync>)>,
}

impl Registry {

    /// Creates a new logger registry timestamped against `time`.
    pub fn new(time: Instant) -> Self {
        Registry {
            time,
            map: HashMap::new(),
        }
    }

    /// Binds a log name to an action on log event batches.
    ///
    /// Any previously bound logger under `name` is returned, and will continue to function until
    /// all of its clones are dropped. Subsequent calls to `get(name)` will return a logger using
    /// `action`.
    ///
    /// The action receives the time of the flush and the buffer of events, which it may drain. An
    /// empty buffer indicates that the logger has been dropped and no further events will follow.
    pub fn insert<T, F>(&mut self, name: &str, action: F) -> Option<Box<dyn Any + Send + Sync>>
    where
        T: Send + 'static,
        F: FnMut(&Duration, &mut Vec<(Duration, T)>) + Send + 'static,
    {
        let logger = Logger::<T>::new(self.time, action);
        self.insert_logger(name, logger)
    }

    /// Binds a log name to an existing logger.
    pub fn insert_logger<T: Send + 'static>(&mut self, name: &str, logger: Logger<T>) -> Option<Box<dyn Any + Send + Sync>> {
        self.map
            .insert(name.to_owned(), (Box::new(logger.clone()), Box::new(logger)))
            .map(|(logger, _)| logger)
    }

    /// Removes a bound logger.
    ///
    /// The logger continues to function for clones held elsewhere; it stops once they drop.
    pub fn remove(&mut self, name: &str) -> Option<Box<dyn Any + Send + Sync>> {
        self.map.remove(name).map(|(logger, _)| logger)
    }

    /// Retrieves a shared logger, if one has been inserted under `name` with event type `T`.
    pub fn get<T: Send + 'static>(&self, name: &str) -> Option<Logger<T>> {
        self.map
            .get(name)
            .and_then(|(logger, _)| logger.downcast_ref::<Logger<T>>())
            .cloned()
    }

    /// Flushes all registered loggers.
    pub fn flush(&mut self) {
        for (_, flush) in self.map.values() {
            flush.flush();
        }
    }

    /// The instant against which events are timestamped.
    pub fn time(&self) -> Instant {
        self.time
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.flush();
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = self.map.keys().collect::<Vec<_>>();
        names.sort();
        f.debug_struct("Registry")
            .field("names", &names)
            .finish()
    }
}

/// A buffering logger.
pub struct Logger<T> {
    inner: Arc<Mutex<LoggerInner<T>>>,
}

impl<T> Clone for Logger<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

struct LoggerInner<T> {
    /// The instant at which the registry was created.
    time: Instant,
    /// Events not yet presented to the action.
    buffer: Vec<(Duration, T)>,
    /// Action applied to full or flushed buffers.
    action: Box<dyn FnMut(&Duration, &mut Vec<(Duration, T)>) + Send>,
}

impl<T> Logger<T> {

    /// Allocates a new shareable logger bound to a write destination.
    pub fn new<F>(time: Instant, action: F) -> Self
    where
        F: FnMut(&Duration, &mut Vec<(Duration, T)>) + Send + 'static,
    {
        let inner = LoggerInner {
            time,
            buffer: Vec::with_capacity(BUFFER_CAPACITY),
            action: Box::new(action),
        };
        Logger { inner: Arc::new(Mutex::new(inner)) }
    }

    /// Logs an event.
    ///
    /// The event is timestamped with the elapsed time since the registry was created. If the
    /// buffer reaches its capacity it is handed to the action immediately.
    pub fn log<E: Into<T>>(&self, event: E) {
        self.log_many(Some(event));
    }

    /// Logs multiple events.
    pub fn log_many<E: Into<T>, I: IntoIterator<Item = E>>(&self, events: I) {
        if let Ok(mut inner) = self.inner.lock() {
            let elapsed = inner.time.elapsed();
            for event in events {
                inner.buffer.push((elapsed, event.into()));
                if inner.buffer.len() >= BUFFER_CAPACITY {
                    inner.flush();
                }
            }
        }
    }

    /// Presents any buffered events to the action.
    pub fn flush(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.flush();
        }
    }
}

impl<T> LoggerInner<T> {
    fn flush(&mut self) {
        if !self.buffer.is_empty() {
            let elapsed = self.time.elapsed();
            (self.action)(&elapsed, &mut self.buffer);
            self.buffer.clear();
        }
    }
}

impl<T> Drop for LoggerInner<T> {
    fn drop(&mut self) {
        self.flush();
        // An empty batch indicates the end of the stream.
        let elapsed = self.time.elapsed();
        (self.action)(&elapsed, &mut self.buffer);
    }
}

/// Types that can be flushed.
trait Flush {
    /// Flushes any buffered data.
    fn flush(&self);
}

impl<T> Flush for Logger<T> {
    fn flush(&self) {
        Logger::flush(self)
    }
}

#[cfg(test)]
mod tests {

    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    use super::{Logger, Registry};

    #[test]
    fn registry_round_trip() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let mut registry = Registry::new(Instant::now());
        registry.insert::<u64, _>("numbers", move |_time, data| {
            sink.lock().unwrap().extend(data.drain(..).map(|(_, x)| x));
        });

        let logger = registry.get::<u64>("numbers").expect("logger registered");
        logger.log(1u64);
        logger.log_many(vec![2u64, 3]);
        assert!(seen.lock().unwrap().is_empty());

        registry.flush();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn wrong_type_is_absent() {
        let mut registry = Registry::new(Instant::now());
        registry.insert::<u64, _>("numbers", |_, _| { });
        assert!(registry.get::<String>("numbers").is_none());
        assert!(registry.get::<u64>("letters").is_none());
    }

    #[test]
    fn drop_signals_end() {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&batches);
        let logger = Logger::<u32>::new(Instant::now(), move |_, data| {
            sink.lock().unwrap().push(data.len());
        });
        logger.log(7u32);
        drop(logger);
        // One batch with the event, then the empty end-of-stream batch.
        assert_eq!(*batches.lock().unwrap(), vec![1, 0]);
    }

    #[test]
    fn full_buffer_flushes() {
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        let logger = Logger::<usize>::new(Instant::now(), move |_, data| {
            *sink.lock().unwrap() += data.len();
        });
        logger.log_many(0 .. super::BUFFER_CAPACITY);
        assert_eq!(*count.lock().unwrap(), super::BUFFER_CAPACITY);
    }
}
