/// What the memory manager needs from the architecture/SMP layer.
pub trait Platform: Send + Sync {
    /// Index of the calling CPU, below [`MAX_CPUS`](crate::cpu::MAX_CPUS).
    fn current_cpu(&self) -> usize;

    /// Raise the TLB-shootdown IPI on `cpu`. Its handler must call
    /// [`Vm::handle_shootdown_ipi`](crate::Vm::handle_shootdown_ipi).
    fn send_invalidate_ipi(&self, cpu: usize);

    /// Stop every other CPU.
    fn broadcast_halt(&self);

    /// Stop the calling CPU for good.
    fn halt_forever(&self) -> !;
}
