//! Input event routing: the event model, window descriptors, the transport to windows and the
//! dispatcher that ties them together.

pub mod channel;
pub mod dispatcher;
pub mod event;
pub mod window;
