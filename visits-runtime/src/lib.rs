pub use {
    visits_common::{CountResponse, HttpRequest, HttpResponse},
    crate::{
        handler::CounterHandler,
        server::VisitsServer,
    },
};

pub mod config;
pub mod error;
pub mod handler;
pub mod http;
pub mod kv;
pub mod metrics;
pub mod server;
