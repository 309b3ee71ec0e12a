use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::info;
use tracing_subscriber::EnvFilter;

use spindle_core::{
    Engine, Observer, SingleTask, TaskKey, TaskStatus, Work, WorkError,
};

/// One frame of the sample render job.
#[derive(Debug, Deserialize)]
struct RenderFrame {
    frame: String,
    scene: String,
    fail: bool,
}

struct RenderWork {
    scene: String,
    fail: bool,
}

#[async_trait]
impl Work<String> for RenderWork {
    async fn process(&self) -> Result<String, WorkError> {
        // Pretend to render.
        sleep(Duration::from_millis(50)).await;
        if self.fail {
            return Err(format!("render failed for scene {}", self.scene).into());
        }
        Ok(format!("rendered {}", self.scene))
    }
}

/// Observer that logs every outcome for one unit.
struct LogObserver {
    label: String,
}

impl Observer<String> for LogObserver {
    fn on_completed(&self, value: &String) {
        info!(unit = %self.label, %value, "completed");
    }

    fn on_canceled(&self) {
        info!(unit = %self.label, "canceled");
    }

    fn on_failed(&self, cause: &WorkError) {
        info!(unit = %self.label, error = %cause, "failed");
    }
}

fn observer(label: &str) -> Vec<Arc<dyn Observer<String>>> {
    vec![Arc::new(LogObserver {
        label: label.to_string(),
    })]
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // (A) A small job list: sibling frames of one render job.
    let frames: Vec<RenderFrame> = serde_json::from_str(
        r#"[
            {"frame": "001", "scene": "intro", "fail": false},
            {"frame": "002", "scene": "chase", "fail": true},
            {"frame": "003", "scene": "finale", "fail": false}
        ]"#,
    )
    .expect("sample job list parses");

    let engine: Engine<String, String> = Engine::new();

    // (B) Schedule every frame under the shared major key "render". All of
    // them attach to one aggregate and one scheduled record.
    let mut units = Vec::new();
    for frame in &frames {
        let key = TaskKey::composite("render".to_string(), [frame.frame.clone()]);
        let unit = Arc::new(SingleTask::new(
            key,
            RenderWork {
                scene: frame.scene.clone(),
                fail: frame.fail,
            },
        ));
        let record = engine
            .schedule_once(
                Duration::from_millis(200),
                Arc::clone(&unit),
                observer(&format!("render/{}", frame.frame)),
            )
            .expect("schedule accepts the frame");
        info!(frame = %frame.frame, execution = %record.id(), "frame scheduled");
        units.push(unit);
    }

    // (C) Cancel one sibling before the firing: it reports cancellation,
    // the others render anyway.
    units[2].cancel();
    info!("frame 003 canceled before the firing");

    // (D) An immediate one-off next to the aggregate.
    engine
        .execute(
            Arc::new(SingleTask::new(
                TaskKey::simple("thumbnail".to_string()),
                RenderWork {
                    scene: "thumbnail".to_string(),
                    fail: false,
                },
            )),
            observer("thumbnail"),
        )
        .expect("execute accepts the one-off");

    // (E) Poll until the aggregate record is gone from the engine.
    let aggregate_key = TaskKey::simple("render".to_string());
    loop {
        let status = engine.task_status(&aggregate_key);
        info!(?status, counts = ?engine.counts_by_status(), "polling");
        if status == TaskStatus::NotStarted {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }

    engine.shutdown();
    info!("done");
}
