pub trait RNNState {
    /// Advances the state by one time step and returns the new memories.
    fn propagate<'a, 'b>(&'a mut self, inputs: &'b [f64]) -> &'a [f64];
    /// Current memories, i.e. the state after the last propagate().
    fn memories(&self) -> &[f64];
}
