//! Interactive viewer over a streaming connection.
//!
//! Binds one render loop and its camera to an image sink: sizing the
//! camera, streaming frames and picking objects under the cursor.

use std::sync::Arc;

use tokio::sync::watch;

use prism_core::{CancelMode, Command, CommandError, ImageSink, State, Value};

use crate::client::{ImageArrival, StreamStatus, WsConnector};
use crate::error::TransportError;
use crate::stream::FrameCallback;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerConfig {
    pub render_loop_name: String,
    pub camera_name: String,
}

/// First hit reported by `render_loop_pick`.
#[derive(Debug, Clone, PartialEq)]
pub struct PickResult {
    pub object_name: String,
    pub world_point: Option<[f64; 3]>,
    /// The full hit record as returned by the server.
    pub raw: Value,
}

impl PickResult {
    /// Parses the first element of a pick result array. `None` when
    /// nothing was hit.
    pub fn from_value(value: &Value) -> Option<Self> {
        let hit = value.as_array()?.first()?;
        let object_name = hit
            .get("picked_object_name")
            .and_then(Value::as_str)?
            .to_string();
        let world_point = hit.get("world_point").and_then(|point| {
            Some([
                point.get("x")?.as_f64()?,
                point.get("y")?.as_f64()?,
                point.get("z")?.as_f64()?,
            ])
        });
        Some(Self {
            object_name,
            world_point,
            raw: hit.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Viewer {
    connector: WsConnector,
    config: ViewerConfig,
    state: Arc<State>,
}

impl Viewer {
    pub fn new(connector: WsConnector, config: ViewerConfig) -> Self {
        let state = State::render_loop(config.render_loop_name.clone(), CancelMode::Cooperative, false).into_ref();
        Self {
            connector,
            config,
            state,
        }
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    pub fn connector(&self) -> &WsConnector {
        &self.connector
    }

    /// Sizes the camera to `width`x`height` and starts streaming to `sink`.
    pub async fn start(
        &self,
        sink: Arc<dyn ImageSink>,
        width: u32,
        height: u32,
    ) -> Result<(), TransportError> {
        self.start_with(sink, width, height, None).await
    }

    pub async fn start_with(
        &self,
        sink: Arc<dyn ImageSink>,
        width: u32,
        height: u32,
        on_frame: Option<FrameCallback>,
    ) -> Result<(), TransportError> {
        if width == 0 || height == 0 {
            return Err(CommandError::encode(format!("invalid viewport {width}x{height}")).into());
        }
        let camera = self.config.camera_name.as_str();
        let commands = [
            Command::new("camera_set_resolution")
                .param("camera_name", camera)
                .param("resolution", Value::map().with("x", width).with("y", height)),
            Command::new("camera_set_aspect")
                .param("camera_name", camera)
                .param("aspect", f64::from(width) / f64::from(height)),
        ];
        let results = self.connector.execute(&commands, Some(self.state.as_ref())).await?;
        for result in results {
            if let Err(e) = result {
                log::error!("viewer setup on {} failed: {e}", self.config.render_loop_name);
                return Err(e.into());
            }
        }
        log::info!(
            "viewer on {} sized {width}x{height}",
            self.config.render_loop_name
        );
        self.connector
            .start_stream(&self.config.render_loop_name, sink, on_frame)
            .await
    }

    pub async fn stop(&self) -> Result<(), TransportError> {
        self.connector.stop_stream(&self.config.render_loop_name).await
    }

    /// Picks at viewport coordinates. Display is paused while the pick runs
    /// so the picked frame stays on screen.
    pub async fn pick(&self, x: f64, y: f64) -> Result<Option<PickResult>, TransportError> {
        let render_loop = self.config.render_loop_name.as_str();
        self.connector.pause_display(render_loop)?;
        let command = Command::new("render_loop_pick")
            .param("render_loop_name", render_loop)
            .param("position", Value::map().with("x", x).with("y", y));
        let outcome = self.connector.execute(std::slice::from_ref(&command), None).await;
        if let Err(e) = self.connector.resume_display(render_loop, false) {
            log::debug!("resume after pick: {e}");
        }
        match outcome?.pop() {
            Some(Ok(value)) => Ok(PickResult::from_value(&value)),
            Some(Err(e)) => Err(e.into()),
            None => Err(CommandError::missing_response().into()),
        }
    }

    pub fn pause_display(&self) -> Result<u32, TransportError> {
        self.connector.pause_display(&self.config.render_loop_name)
    }

    pub fn resume_display(&self, force: bool) -> Result<u32, TransportError> {
        self.connector
            .resume_display(&self.config.render_loop_name, force)
    }

    pub fn status(&self) -> watch::Receiver<StreamStatus> {
        self.connector.status()
    }

    pub fn arrivals(&self) -> watch::Receiver<ImageArrival> {
        self.connector.arrivals()
    }
}
