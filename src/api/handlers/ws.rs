// src/api/handlers/ws.rs
use actix::{Actor, Addr, AsyncContext, Handler, Message, StreamHandler};
use actix_web::{Error, HttpRequest, HttpResponse, web};
use actix_web_actors::ws;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::progress::{JobState, ProgressState, ProgressTracker};

/// Progress change pushed to every connected client.
#[derive(Message, Clone, Serialize)]
#[rtype(result = "()")]
pub struct JobUpdate {
    pub id: String,
    pub report: String,
    pub state: JobState,
    pub status_message: String,
    pub percent: Option<f64>,
    pub cancel_requested: bool,
}

impl From<ProgressState> for JobUpdate {
    fn from(state: ProgressState) -> Self {
        Self {
            id: state.job_id,
            report: state.caption,
            state: state.state,
            status_message: state.status_message,
            percent: state.percent,
            cancel_requested: state.cancel_requested,
        }
    }
}

#[derive(Clone, Default)]
pub struct WsBroker {
    clients: Arc<RwLock<Vec<Addr<WsConnection>>>>,
}

impl WsBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, addr: Addr<WsConnection>) {
        let mut clients = self.clients.write().await;
        clients.push(addr);
    }

    pub async fn unregister(&self, addr: &Addr<WsConnection>) {
        let mut clients = self.clients.write().await;
        clients.retain(|c| c != addr);
    }

    pub async fn broadcast(&self, msg: JobUpdate) {
        let clients = self.clients.read().await;
        for client in clients.iter() {
            client.do_send(msg.clone());
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Pushes every progress change of `tracker` to the connected clients.
    pub fn forward_progress(&self, tracker: &ProgressTracker) -> JoinHandle<()> {
        let broker = self.clone();
        let mut updates = tracker.subscribe();
        tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(state) => broker.broadcast(JobUpdate::from(state)).await,
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Websocket clients missed {} progress updates", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

pub struct WsConnection {
    broker: WsBroker,
}

impl WsConnection {
    pub fn new(broker: WsBroker) -> Self {
        Self { broker }
    }
}

impl Actor for WsConnection {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let addr = ctx.address();
        let broker = self.broker.clone();
        actix::spawn(async move {
            broker.register(addr).await;
        });
    }

    fn stopped(&mut self, ctx: &mut Self::Context) {
        let addr = ctx.address();
        let broker = self.broker.clone();
        actix::spawn(async move {
            broker.unregister(&addr).await;
        });
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsConnection {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => ctx.pong(&msg),
            Ok(ws::Message::Close(reason)) => ctx.close(reason),
            _ => (),
        }
    }
}

impl Handler<JobUpdate> for WsConnection {
    type Result = ();

    fn handle(&mut self, msg: JobUpdate, ctx: &mut Self::Context) {
        match serde_json::to_string(&msg) {
            Ok(json) => ctx.text(json),
            Err(e) => log::warn!("Could not serialise job update: {}", e),
        }
    }
}

pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    broker: web::Data<WsBroker>,
) -> Result<HttpResponse, Error> {
    let conn = WsConnection::new(broker.get_ref().clone());
    ws::start(conn, &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[actix_web::test]
    async fn test_forwarder_runs_without_clients() {
        let tracker = ProgressTracker::new();
        let broker = WsBroker::new();
        let handle = broker.forward_progress(&tracker);

        tracker.init("job-1", "PartnerByCity").await;
        tracker.set_status("job-1", "Calculating", Some(50.0)).await.unwrap();

        assert_eq!(broker.client_count().await, 0);
        assert!(!handle.is_finished());
        handle.abort();
    }

    #[test]
    fn test_update_from_progress_state() {
        let tracker_state = ProgressState {
            job_id: "job-1".to_string(),
            caption: "PartnerByCity".to_string(),
            status_message: "Calculating row 1 of 2".to_string(),
            percent: Some(0.0),
            state: JobState::Running,
            cancel_requested: false,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            finished_at: None,
        };

        let update = JobUpdate::from(tracker_state);
        assert_eq!(update.id, "job-1");
        assert_eq!(update.report, "PartnerByCity");
        assert_eq!(update.state, JobState::Running);
    }
}
