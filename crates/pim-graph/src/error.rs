use pim::GfxError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Graphics error: {0}")]
    Gfx(#[from] GfxError),
    ///A physical resource could not be created. Passes that declared it are skipped for the frame.
    #[error("Creating physical resource {name} failed: {source}")]
    Allocation {
        name: String,
        #[source]
        source: GfxError,
    },
}
