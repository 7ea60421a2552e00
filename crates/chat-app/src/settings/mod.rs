pub mod state;

pub use state::{
    DEFAULT_STARTER_PROMPTS, Greeting, RevealSettings, Settings, SettingsError, SettingsStore,
};
