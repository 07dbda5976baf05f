//! Application-wide view state shared by every handler: which routes are on
//! the map, display toggles, and whether the trip planner panel is open.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapSettings {
    /// Only show vehicles that pinged recently.
    pub recent_only: bool,
    pub display_time: bool,
    pub dark_mode: bool,
}

impl Default for MapSettings {
    fn default() -> Self {
        MapSettings {
            recent_only: true,
            display_time: true,
            dark_mode: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PlannerPanel {
    pub open: bool,
    pub maximized: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UiContext {
    pub selected_routes: BTreeSet<String>,
    pub settings: MapSettings,
    pub planner: PlannerPanel,
}

impl UiContext {
    pub fn with_routes<I, S>(routes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ctx = UiContext::default();
        ctx.set_routes(routes);
        ctx
    }

    /// Replaces the selection. Blank ids are ignored.
    pub fn set_routes<I, S>(&mut self, routes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selected_routes = routes
            .into_iter()
            .map(Into::into)
            .map(|r: String| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
    }

    /// Returns whether the route is selected afterwards. Blank ids are never
    /// selected.
    pub fn toggle_route(&mut self, route: &str) -> bool {
        let route = route.trim();
        if route.is_empty() {
            return false;
        }
        if self.selected_routes.remove(route) {
            false
        } else {
            self.selected_routes.insert(route.to_string());
            true
        }
    }

    pub fn open_planner(&mut self) {
        self.planner.open = true;
    }

    /// Closing also restores the normal size.
    pub fn close_planner(&mut self) {
        self.planner = PlannerPanel::default();
    }

    pub fn toggle_maximize(&mut self) -> bool {
        self.planner.maximized = !self.planner.maximized;
        self.planner.maximized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_is_a_set() {
        let ctx = UiContext::with_routes(["522", "543", "522", " 543 ", ""]);
        assert_eq!(ctx.selected_routes.len(), 2);
        assert!(ctx.selected_routes.contains("543"));
    }

    #[test]
    fn toggle_adds_then_removes() {
        let mut ctx = UiContext::default();
        assert!(ctx.toggle_route("615"));
        assert!(ctx.selected_routes.contains("615"));
        assert!(!ctx.toggle_route("615"));
        assert!(ctx.selected_routes.is_empty());
    }

    #[test]
    fn toggle_ignores_blank_ids() {
        let mut ctx = UiContext::with_routes(["522"]);
        assert!(!ctx.toggle_route("   "));
        assert!(!ctx.toggle_route(""));
        assert_eq!(ctx.selected_routes.len(), 1);
        assert!(ctx.selected_routes.contains("522"));
    }

    #[test]
    fn closing_planner_resets_maximize() {
        let mut ctx = UiContext::default();
        ctx.open_planner();
        assert!(ctx.toggle_maximize());
        assert_eq!(ctx.planner, PlannerPanel { open: true, maximized: true });

        ctx.close_planner();
        assert_eq!(ctx.planner, PlannerPanel::default());
    }

    #[test]
    fn settings_default_to_recent_vehicles_only() {
        let settings: MapSettings = serde_json::from_str(r#"{"dark_mode": true}"#).unwrap();
        assert!(settings.recent_only);
        assert!(settings.dark_mode);
    }
}
