use ash::vk;
use smallvec::SmallVec;

use super::{AccelerationStructureBuild, Barrier, Command, ResourceRef};

/// Records the commands of one frame.
///
/// Barriers are batched and flushed as a single `PipelineBarrier` in front of the next command,
/// so consecutive barriers issued by independent passes still cost one split.
#[derive(Default)]
pub struct CommandRecorder {
    commands: Vec<Command>,
    barriers: SmallVec<[Barrier; 8]>,
}

impl CommandRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uav_barrier(&mut self, resource: ResourceRef) {
        let barrier = Barrier::Uav(resource);
        if !self.barriers.contains(&barrier) {
            self.barriers.push(barrier);
        }
    }

    pub fn transition(
        &mut self,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        if old_layout == new_layout {
            return;
        }
        self.barriers.push(Barrier::Transition {
            image,
            old_layout,
            new_layout,
        });
    }

    pub fn commit_barriers(&mut self) {
        if !self.barriers.is_empty() {
            let barriers = std::mem::take(&mut self.barriers);
            self.commands.push(Command::PipelineBarrier(barriers));
        }
    }

    pub fn push(&mut self, command: Command) {
        self.commit_barriers();
        self.commands.push(command);
    }

    pub fn build_acceleration_structure(&mut self, build: AccelerationStructureBuild) {
        self.push(Command::BuildAccelerationStructure(Box::new(build)));
    }

    pub fn bind_pipeline(&mut self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        self.push(Command::BindPipeline {
            bind_point,
            pipeline,
        });
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.push(Command::Dispatch { x, y, z });
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.barriers.is_empty()
    }

    /// Takes everything recorded so far, flushing outstanding barriers.
    pub fn finish(&mut self) -> Vec<Command> {
        self.commit_barriers();
        std::mem::take(&mut self.commands)
    }
}
