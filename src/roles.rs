use serde::{Deserialize, Serialize};

use crate::config::VisionConfig;

/// Logical camera designation deciding which processing policy applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CameraRole {
    /// Wrist-mounted camera looking at the gripper; gets background removal.
    Gripper,
    /// Scene overview camera; raw or brightness-stabilized only.
    Top,
}

impl CameraRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            CameraRole::Gripper => "gripper",
            CameraRole::Top => "top",
        }
    }
}

/// Map a camera key string to its role using the configured key names.
/// Keys matching neither configured name have no role and are passed
/// through untouched by the processor.
pub fn camera_role_for_key(camera_key: &str, config: &VisionConfig) -> Option<CameraRole> {
    if camera_key == config.gripper_camera_key {
        Some(CameraRole::Gripper)
    } else if camera_key == config.top_camera_key {
        Some(CameraRole::Top)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_keys_map_to_roles() {
        let config = VisionConfig::default();
        assert_eq!(
            camera_role_for_key("gripper", &config),
            Some(CameraRole::Gripper)
        );
        assert_eq!(camera_role_for_key("top", &config), Some(CameraRole::Top));
        assert_eq!(camera_role_for_key("side", &config), None);
        assert_eq!(camera_role_for_key("", &config), None);
    }

    #[test]
    fn custom_keys_are_respected() {
        let config = VisionConfig {
            gripper_camera_key: "wrist_cam".to_string(),
            top_camera_key: "overview".to_string(),
            ..VisionConfig::default()
        };
        assert_eq!(
            camera_role_for_key("wrist_cam", &config),
            Some(CameraRole::Gripper)
        );
        assert_eq!(
            camera_role_for_key("overview", &config),
            Some(CameraRole::Top)
        );
        // The default names no longer map once remapped.
        assert_eq!(camera_role_for_key("gripper", &config), None);
        assert_eq!(camera_role_for_key("top", &config), None);
    }
}
