use crate::engine::EngineHandle;
use std::path::PathBuf;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus control surface for the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    engine: EngineHandle,
}

impl AttendanceService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Start an attendance session. No-op if one is running.
    async fn start(&self) -> zbus::fdo::Result<()> {
        tracing::info!("start requested");
        self.engine.start().await.map_err(failed)
    }

    /// Stop the session and release the camera. No-op if idle.
    async fn stop(&self) -> zbus::fdo::Result<()> {
        tracing::info!("stop requested");
        self.engine.stop().await.map_err(failed)
    }

    /// Allow everyone to be logged again.
    async fn clear(&self) -> zbus::fdo::Result<()> {
        tracing::info!("clear requested");
        self.engine.clear().await.map_err(failed)
    }

    /// Return daemon status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(failed)?;
        serde_json::to_string(&status).map_err(failed)
    }

    /// Recent attendance lines as a JSON array of strings, oldest first.
    async fn recent_log(&self) -> zbus::fdo::Result<String> {
        let lines = self.engine.recent_log().await.map_err(failed)?;
        serde_json::to_string(&lines).map_err(failed)
    }

    /// Save the latest annotated frame as a PNG at `path`.
    async fn snapshot(&self, path: &str) -> zbus::fdo::Result<()> {
        tracing::info!(path, "snapshot requested");
        self.engine.snapshot(PathBuf::from(path)).await.map_err(failed)
    }
}
