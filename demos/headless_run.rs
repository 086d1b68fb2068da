// same frame loop on the software device, no window or GPU needed
use bevy::log::LogPlugin;
use bevy::prelude::*;
use bevy_lego_ocean::HeadlessOceanPlugin;
use bevy_lego_ocean::config::SimConfig;

fn main() -> AppExit {
    App::new()
        .add_plugins((MinimalPlugins, LogPlugin::default()))
        .add_plugins(HeadlessOceanPlugin {
            config: SimConfig::small(10_000),
            frames: 240,
            ..default()
        })
        .run()
}
