// Trading core: position lifecycle, reconciliation, closing, control loop
pub mod closer;
pub mod position;
pub mod reconcile;
pub mod trader;

pub use closer::{CloseRequest, CloserEvent, CloserHandle};
pub use position::{Position, PositionBook, PositionState};
pub use reconcile::{reconcile, ExitLeg, Reconciliation};
pub use trader::{Trader, TraderSettings, TraderSnapshot};
