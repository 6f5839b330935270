//! Stage builders shared by the integration tests

use workers_rs::pipeline::{CancelToken, Stage, StageBuilder, Worker};

/// Field read by [`multiplier`]
pub const FACTOR: &str = "factor";

/// Stage multiplying each input by its integer `factor` field
pub fn multiplier(name: &str, cancel: CancelToken, factor: i64) -> StageBuilder<i64, i64> {
    Stage::builder(name, cancel, |w: &Worker<i64, i64>| {
        let factor = w.try_field_int(FACTOR)?;
        for item in w.inputs() {
            w.emit(item * factor)?;
        }
        Ok(())
    })
    .field(FACTOR, factor)
}

/// Stage forwarding every input unchanged
pub fn passthrough(name: &str, cancel: CancelToken) -> StageBuilder<i64, i64> {
    Stage::builder(name, cancel, |w: &Worker<i64, i64>| {
        for item in w.inputs() {
            w.emit(item)?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiplier_builder() {
        let stage = multiplier("x3", CancelToken::new(), 3).start().unwrap();
        stage.send(2).unwrap();
        stage.close().unwrap();
        assert_eq!(stage.outputs().collect::<Vec<_>>(), vec![6]);
        stage.join().unwrap();
    }
}
