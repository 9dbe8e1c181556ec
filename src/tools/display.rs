use std::sync::Arc;

use serde_json::json;

use super::{object_schema, ToolError, ToolRegistry};
use crate::device::{Page, Services};
use crate::orchestrator::Scheduler;
use crate::store;

pub(super) fn register(registry: &mut ToolRegistry, services: Services, scheduler: Scheduler) {
    registry.add(
        "self.display.switch_page",
        "Switch the screen to another page.\n\
         Args:\n  `page`: one of home, music, countdown, memo",
        object_schema(
            json!({"page": {"type": "string", "enum": ["home", "music", "countdown", "memo"]}}),
            &["page"],
        ),
        move |args| {
            let page: Page = args
                .str("page")?
                .parse()
                .map_err(|reason| ToolError::InvalidArgument { name: "page", reason })?;

            // The memo page renders from storage, so refresh it on entry
            let reminders = (page == Page::Memo)
                .then(|| store::load_reminders(services.settings.as_ref()));
            let display = Arc::clone(&services.display);
            scheduler.schedule(move || {
                display.switch_page(page);
                if let Some(reminders) = reminders {
                    display.show_reminders(&reminders);
                }
            });
            Ok(format!("Switched to the {} page", format!("{page:?}").to_lowercase()))
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fakes;

    #[test]
    fn test_switch_page() {
        let fakes = Fakes::new();
        let mut registry = ToolRegistry::new();
        register(&mut registry, fakes.services(), fakes.scheduler.clone());

        let reply = registry
            .call("self.display.switch_page", &json!({"page": "Pomodoro"}))
            .unwrap();
        assert_eq!(reply, "Switched to the countdown page");
        registry
            .call("self.display.switch_page", &json!({"page": "memo"}))
            .unwrap();
        assert!(registry
            .call("self.display.switch_page", &json!({"page": "weather radar"}))
            .is_err());

        fakes.scheduler.run_pending();
        assert_eq!(
            fakes.display.calls(),
            vec!["page:Countdown", "page:Memo", "reminders:0"]
        );
    }
}
