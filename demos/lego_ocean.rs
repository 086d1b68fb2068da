use bevy::prelude::*;
use bevy::render::RenderPlugin;
use bevy::render::settings::WgpuSettings;
use bevy::window::WindowResolution;
use bevy_lego_ocean::{LegoOceanPlugin, SimConfig};

fn main() -> AppExit {
    let config = SimConfig::default();
    let extent = config.window_extent;

    App::new()
        .add_plugins(
            DefaultPlugins
                .set(WindowPlugin {
                    primary_window: Some(Window {
                        title: "lego ocean".into(),
                        resolution: WindowResolution::new(extent.width as f32, extent.height as f32),
                        ..default()
                    }),
                    ..default()
                })
                // the ocean renderer owns the window surface
                .set(RenderPlugin {
                    render_creation: WgpuSettings {
                        backends: None,
                        ..default()
                    }
                    .into(),
                    ..default()
                }),
        )
        .add_plugins(LegoOceanPlugin { config })
        .run()
}
