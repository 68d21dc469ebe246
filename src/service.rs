//! Update requests queued from other threads, run one at a time.

use core::fmt::Debug;
use std::sync::mpsc::{Receiver, Sender};

use embedded_hal::blocking::delay::DelayMs;

use crate::flasher::Flasher;
use crate::image::ImageSource;
use crate::SerialPort;

/// An image to push to the device
pub struct UpdateRequest {
    /// Name used in status messages
    pub name: String,
    pub image: Box<dyn ImageSource + Send>,
}

impl UpdateRequest {
    pub fn new<S: ImageSource + Send + 'static>(name: &str, image: S) -> Self {
        Self {
            name: name.to_string(),
            image: Box::new(image),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Status {
    Connected,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub status: Status,
    pub message: String,
}

impl StatusEvent {
    fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Destination for service status events
pub trait StatusSink {
    fn publish(&mut self, event: StatusEvent);
}

impl StatusSink for Sender<StatusEvent> {
    fn publish(&mut self, event: StatusEvent) {
        // Nobody listening is fine
        let _ = self.send(event);
    }
}

/// Sink writing status events to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatus;

impl StatusSink for LogStatus {
    fn publish(&mut self, event: StatusEvent) {
        match event.status {
            Status::Failed => error!("{}", event.message),
            _ => info!("{}", event.message),
        }
    }
}

/// Runs queued update requests against a single flasher
pub struct UpdateService<P, D, E, S> {
    flasher: Flasher<P, D, E>,
    requests: Receiver<UpdateRequest>,
    status: S,
}

impl<P, D, E, S> UpdateService<P, D, E, S>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
    S: StatusSink,
{
    pub fn new(flasher: Flasher<P, D, E>, requests: Receiver<UpdateRequest>, status: S) -> Self {
        Self {
            flasher,
            requests,
            status,
        }
    }

    /// Handle requests until every sender is dropped, then give back the flasher
    pub fn run(mut self) -> Flasher<P, D, E> {
        self.status
            .publish(StatusEvent::new(Status::Connected, "Device ready to receive cmd"));

        while let Ok(req) = self.requests.recv() {
            info!("Update request: {} ({} bytes)", req.name, req.image.len());

            let event = match self.flasher.update(req.image) {
                Ok(session) => {
                    debug!("{} written in {} steps", req.name, session.steps.len());
                    StatusEvent::new(Status::Success, "firmware updated successfully")
                }
                Err(e) => StatusEvent::new(Status::Failed, format!("{}: {}", req.name, e)),
            };
            self.status.publish(event);
        }

        debug!("Request channel closed, stopping update service");

        self.flasher
    }
}
