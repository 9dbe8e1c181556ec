use std::sync::Weak;

use serde_json::json;

use super::countdown::format_mm_ss;
use super::{object_schema, ToolError, ToolRegistry};
use crate::media::{PlayOutcome, PlayRequest};
use crate::orchestrator::Application;

fn mm_ss(ms: u64) -> String {
    format_mm_ss(ms / 1000)
}

pub(super) fn register(registry: &mut ToolRegistry, app: Weak<Application>) {
    let handle = app.clone();
    registry.add(
        "self.music.play_url",
        "Stream an MP3 from a URL through the speaker, interrupting the conversation.\n\
         Args:\n  `url`: http(s) link to the audio\n  `title`, `artist`: shown on the music page\n  \
         `lyric`: LRC text\n  `lyric_url`: link to an LRC file",
        object_schema(
            json!({
                "url": {"type": "string"},
                "title": {"type": "string"},
                "artist": {"type": "string"},
                "lyric": {"type": "string"},
                "lyric_url": {"type": "string"},
            }),
            &["url"],
        ),
        move |args| {
            let app = handle.upgrade().ok_or(ToolError::Unavailable)?;
            let request = PlayRequest {
                url: args.str("url")?.to_string(),
                title: args.opt_str("title")?.map(str::to_string),
                artist: args.opt_str("artist")?.map(str::to_string),
                lyric_text: args.opt_str("lyric")?.map(str::to_string),
                lyric_url: args.opt_str("lyric_url")?.map(str::to_string),
            };
            let label = request.title.clone().unwrap_or_else(|| request.url.clone());

            match app.play_music(request) {
                Ok(PlayOutcome::Started) => Ok(format!("Now playing: {label}")),
                Ok(PlayOutcome::ReplaySuppressed) => {
                    Ok(format!("{label} just finished playing, not starting it again"))
                }
                Err(e) => Err(ToolError::Failed(e.to_string())),
            }
        },
    );

    let handle = app.clone();
    registry.add(
        "self.music.stop",
        "Stop music playback",
        object_schema(json!({}), &[]),
        move |_| {
            let app = handle.upgrade().ok_or(ToolError::Unavailable)?;
            if !app.player().is_playing() {
                return Ok("Nothing is playing".to_string());
            }
            app.stop_music()
                .map_err(|e| ToolError::Failed(e.to_string()))?;
            Ok("Playback stopped".to_string())
        },
    );

    let handle = app.clone();
    registry.add(
        "self.music.status",
        "Report what is playing and how far along it is",
        object_schema(json!({}), &[]),
        move |_| {
            let app = handle.upgrade().ok_or(ToolError::Unavailable)?;
            Ok(match app.player().now_playing() {
                Some(now) if now.total_ms > 0 => format!(
                    "Playing {} by {}, {} / {}",
                    now.title,
                    now.artist,
                    mm_ss(now.position_ms),
                    mm_ss(now.total_ms)
                ),
                Some(now) => format!(
                    "Playing {} by {}, {} elapsed",
                    now.title,
                    now.artist,
                    mm_ss(now.position_ms)
                ),
                None => "Not playing".to_string(),
            })
        },
    );

    registry.add(
        "self.music.history",
        "List recently played tracks with the position they reached",
        object_schema(json!({}), &[]),
        move |_| {
            let app = app.upgrade().ok_or(ToolError::Unavailable)?;
            let history = app.player().history();
            if history.is_empty() {
                return Ok("No recently played tracks".to_string());
            }

            let mut out = String::from("Recently played:");
            for (i, (url, entry)) in history.iter().enumerate() {
                out.push_str(&format!("\n{}. {} ({}", i + 1, entry.title, mm_ss(entry.position_ms)));
                if entry.total_ms > 0 {
                    out.push_str(&format!(" / {}", mm_ss(entry.total_ms)));
                }
                out.push_str(&format!(") {url}"));
            }
            Ok(out)
        },
    );
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::media::PlayerConfig;
    use crate::orchestrator::{AppOptions, MediaBackend};
    use crate::testing::{pcm_bytes, Fakes, PcmDecoderFactory, ScriptedSource};

    fn registry_for(fakes: &Fakes, source: ScriptedSource) -> (Arc<Application>, ToolRegistry) {
        let options = AppOptions {
            player: PlayerConfig {
                empty_read_interval: Duration::from_millis(1),
                stop_poll_interval: Duration::from_millis(1),
                ..PlayerConfig::default()
            },
            ..AppOptions::default()
        };
        let app = Application::new(
            fakes.services(),
            fakes.scheduler.clone(),
            Arc::clone(&fakes.state),
            options,
            MediaBackend {
                source: Arc::new(source),
                decoders: Arc::new(PcmDecoderFactory::new(16_000, 1)),
            },
        );
        fakes.scheduler.bind_current_thread();
        let mut registry = ToolRegistry::new();
        register(&mut registry, Arc::downgrade(&app));
        (app, registry)
    }

    #[test]
    fn test_play_status_stop() {
        let fakes = Fakes::new();
        let (app, registry) = registry_for(&fakes, ScriptedSource::endless(pcm_bytes(&[5; 32])));

        assert_eq!(registry.call("self.music.status", &json!({})).unwrap(), "Not playing");
        let reply = registry
            .call(
                "self.music.play_url",
                &json!({"url": "http://radio.test/x.mp3", "title": "Blue", "artist": "Band"}),
            )
            .unwrap();
        assert_eq!(reply, "Now playing: Blue");
        assert!(registry
            .call("self.music.status", &json!({}))
            .unwrap()
            .starts_with("Playing Blue by Band"));

        assert_eq!(registry.call("self.music.stop", &json!({})).unwrap(), "Playback stopped");
        assert_eq!(registry.call("self.music.stop", &json!({})).unwrap(), "Nothing is playing");
        assert!(!app.player().is_playing());
    }

    #[test]
    fn test_play_requires_url() {
        let fakes = Fakes::new();
        let (_app, registry) = registry_for(&fakes, ScriptedSource::new(Vec::new()));
        assert!(matches!(
            registry.call("self.music.play_url", &json!({"url": "  "})),
            Err(ToolError::MissingArgument("url"))
        ));
    }

    #[test]
    fn test_tools_unavailable_after_shutdown() {
        let fakes = Fakes::new();
        let (app, registry) = registry_for(&fakes, ScriptedSource::new(Vec::new()));
        drop(app);
        assert!(matches!(
            registry.call("self.music.history", &json!({})),
            Err(ToolError::Unavailable)
        ));
    }
}
