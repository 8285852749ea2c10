pub mod alerts;
pub mod matching;
pub mod relay;
pub mod rides;
pub mod routing;
pub mod storage;
pub mod vision;
