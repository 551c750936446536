mod app;

pub use app::app;
pub use app::AppState;
