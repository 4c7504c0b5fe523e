//! Tests for collecting the data of queue submissions.

use ash::vk::{self, Handle};
use std::{
    sync::{Arc, mpsc},
    thread,
    time::Duration,
};
use vkprof::{
    commands::{
        command::{BeginRenderPass, Command, Dispatch, Draw, ExecuteCommands},
        resolve::{NoSecondarySnapshots, resolve_timestamps},
        snapshot::CommandBufferSnapshot,
        tree::CommandTimestamps,
    },
    config::ProfilerConfig,
    gpu::testing::{SIMULATED_CLOCK_START, SIMULATED_TICKS_PER_TIMESTAMP, SimulatedDevice},
    profiler::DeviceProfiler,
};

struct TestDevice {
    device: Arc<SimulatedDevice>,
    profiler: DeviceProfiler,
    graphics_pool: vk::CommandPool,
    queue: vk::Queue,
}

impl TestDevice {
    fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = Arc::new(SimulatedDevice::new());
        let profiler = DeviceProfiler::new(device.clone(), ProfilerConfig::default());
        let graphics_pool = device.allocate_command_pool();
        profiler.register_command_pool(
            graphics_pool,
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
        );
        Self {
            device,
            profiler,
            graphics_pool,
            queue: vk::Queue::from_raw(77),
        }
    }

    fn allocate(&self, level: vk::CommandBufferLevel) -> vk::CommandBuffer {
        let command_buffer = self.device.allocate_command_buffer();
        self.profiler
            .allocate_command_buffers(self.graphics_pool, level, &[command_buffer]);
        command_buffer
    }

    fn record(
        &self,
        command_buffer: vk::CommandBuffer,
        usage: vk::CommandBufferUsageFlags,
        commands: impl IntoIterator<Item = Command>,
    ) {
        self.device.begin_command_buffer(command_buffer);
        self.profiler.begin_command_buffer(command_buffer, usage);
        for command in commands {
            let secondaries = match &command {
                Command::ExecuteCommands(args) => args.command_buffers.clone(),
                _ => Vec::new(),
            };
            self.profiler
                .record_command(command_buffer, command, |handle| {
                    if !secondaries.is_empty() {
                        self.device.cmd_execute_commands(handle, &secondaries);
                    }
                });
        }
        self.profiler.end_command_buffer(command_buffer);
    }

    fn record_secondary(&self, command_buffer: vk::CommandBuffer, n_draws: usize) {
        self.record(
            command_buffer,
            vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE,
            (0..n_draws).map(|_| draw()),
        );
    }

    fn record_primary_executing(&self, primary: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]) {
        self.record(
            primary,
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            [
                Command::BeginRenderPass(BeginRenderPass {
                    render_pass: vk::RenderPass::from_raw(5),
                    framebuffer: vk::Framebuffer::from_raw(6),
                    contents: vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
                }),
                Command::ExecuteCommands(ExecuteCommands {
                    command_buffers: secondaries.to_vec(),
                    snapshots: Vec::new(),
                }),
                Command::EndRenderPass,
            ],
        );
    }

    fn execute(&self, command_buffers: &[vk::CommandBuffer]) {
        for &command_buffer in command_buffers {
            self.device.execute(command_buffer);
        }
    }
}

fn dispatch() -> Command {
    Command::Dispatch(Dispatch {
        group_count_x: 4,
        group_count_y: 1,
        group_count_z: 1,
    })
}

fn draw() -> Command {
    Command::Draw(Draw {
        vertex_count: 6,
        instance_count: 1,
        first_vertex: 0,
        first_instance: 0,
    })
}

fn timestamp(n_written_before: u64) -> u64 {
    SIMULATED_CLOCK_START + (n_written_before + 1) * SIMULATED_TICKS_PER_TIMESTAMP
}

fn executed_snapshots(snapshot: &CommandBufferSnapshot) -> Vec<Arc<CommandBufferSnapshot>> {
    snapshot
        .commands()
        .leaves()
        .filter_map(|node| match node.command() {
            Command::ExecuteCommands(args) => Some(args.snapshots.clone()),
            _ => None,
        })
        .flatten()
        .collect()
}

#[test]
fn batch_data_preserves_submission_order() {
    let test = TestDevice::new();
    let command_buffers: Vec<_> = (0..3)
        .map(|_| test.allocate(vk::CommandBufferLevel::PRIMARY))
        .collect();
    for &command_buffer in &command_buffers {
        test.record(
            command_buffer,
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            [dispatch()],
        );
    }

    let batch = test.profiler.submit(
        test.queue,
        &[&command_buffers[..2], &command_buffers[2..]],
    );
    test.execute(&command_buffers);
    let data = test.profiler.collect_submit_batch(&batch);

    assert_eq!(data.queue, test.queue);
    assert_eq!(data.submits.len(), 2);
    assert_eq!(data.submits[0].command_buffers.len(), 2);
    assert_eq!(data.submits[1].command_buffers.len(), 1);

    let handles: Vec<_> = data
        .snapshots()
        .map(|snapshot| snapshot.command_buffer())
        .collect();
    assert_eq!(handles, command_buffers);

    let timestamps: Vec<_> = data
        .snapshots()
        .map(|snapshot| snapshot.timestamps())
        .collect();
    assert_eq!(
        timestamps,
        vec![
            Some(CommandTimestamps::new(timestamp(0), timestamp(1))),
            Some(CommandTimestamps::new(timestamp(2), timestamp(3))),
            Some(CommandTimestamps::new(timestamp(4), timestamp(5))),
        ]
    );
    assert_eq!(data.ticks(), Some((timestamp(0), timestamp(5))));
}

#[test]
fn executed_secondary_is_substituted_with_its_own_snapshot() {
    let test = TestDevice::new();
    let secondary = test.allocate(vk::CommandBufferLevel::SECONDARY);
    let primary = test.allocate(vk::CommandBufferLevel::PRIMARY);
    test.record_secondary(secondary, 3);
    test.record_primary_executing(primary, &[secondary]);

    let batch = test.profiler.submit(test.queue, &[&[primary]]);
    test.execute(&[primary]);
    let data = test.profiler.collect_submit_batch(&batch);

    let primary_snapshot = &data.submits[0].command_buffers[0];
    let executed = executed_snapshots(primary_snapshot);
    assert_eq!(executed.len(), 1);

    let secondary_snapshot = test.profiler.command_buffer_data(secondary).unwrap();
    assert!(Arc::ptr_eq(&executed[0], &secondary_snapshot));

    let secondary_command_buffer = test.profiler.command_buffer(secondary).unwrap();
    let secondary_command_buffer = secondary_command_buffer.lock();
    let independent = resolve_timestamps(
        secondary_command_buffer.recorded_commands().unwrap(),
        &secondary_command_buffer.query_pool().unwrap().read_back(),
        &NoSecondarySnapshots,
    );
    assert_eq!(
        executed[0].commands().node_count(),
        independent.commands.node_count()
    );
    assert_eq!(executed[0].commands(), &independent.commands);

    assert_eq!(
        primary_snapshot.timestamps(),
        Some(CommandTimestamps::new(timestamp(0), timestamp(5)))
    );
    assert_eq!(primary_snapshot.stats().draw_count, 3);
}

#[test]
fn resubmitting_primary_refreshes_executed_secondaries() {
    let test = TestDevice::new();
    let secondary = test.allocate(vk::CommandBufferLevel::SECONDARY);
    let primary = test.allocate(vk::CommandBufferLevel::PRIMARY);
    test.record_secondary(secondary, 1);
    test.record_primary_executing(primary, &[secondary]);

    let batch = test.profiler.submit(test.queue, &[&[primary]]);
    test.execute(&[primary]);
    let first = test.profiler.collect_submit_batch(&batch);
    let first_secondary = test.profiler.command_buffer_data(secondary).unwrap();

    // Secondaries recorded for render pass continuation reset their queries
    // on the host, so they must be recorded again before they are reused.
    test.record_secondary(secondary, 1);
    let batch = test.profiler.submit(test.queue, &[&[primary]]);
    test.execute(&[primary]);
    let second = test.profiler.collect_submit_batch(&batch);
    let second_secondary = test.profiler.command_buffer_data(secondary).unwrap();

    assert!(!Arc::ptr_eq(&first_secondary, &second_secondary));
    assert_eq!(
        first.submits[0].command_buffers[0].timestamps(),
        Some(CommandTimestamps::new(timestamp(0), timestamp(1)))
    );
    assert_eq!(
        second.submits[0].command_buffers[0].timestamps(),
        Some(CommandTimestamps::new(timestamp(2), timestamp(3)))
    );
}

#[test]
fn query_data_buffer_serves_whole_batch_with_one_read() {
    let test = TestDevice::new();
    let secondary = test.allocate(vk::CommandBufferLevel::SECONDARY);
    let primary = test.allocate(vk::CommandBufferLevel::PRIMARY);
    let compute = test.allocate(vk::CommandBufferLevel::PRIMARY);
    let copy = test.device.allocate_command_buffer();
    test.record_secondary(secondary, 2);
    test.record_primary_executing(primary, &[secondary]);
    test.record(
        compute,
        vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        [dispatch(), dispatch()],
    );

    let mut query_data = test.profiler.create_query_data_buffer();
    assert!(query_data.is_device_backed());

    let batch = test.profiler.submit(test.queue, &[&[primary, compute]]);
    test.profiler
        .record_query_data_copies(copy, &batch, &mut query_data)
        .unwrap();
    assert_eq!(query_data.reserved_result_count(), 8);

    test.execute(&[primary, compute, copy]);
    let n_reads_before_fetch = test.device.result_read_count();
    query_data.fetch();
    let data = test.profiler.collect_submit_batch_from(&batch, &query_data);

    assert_eq!(test.device.result_read_count(), n_reads_before_fetch + 1);

    let snapshots: Vec<_> = data.snapshots().collect();
    assert_eq!(
        snapshots[0].timestamps(),
        Some(CommandTimestamps::new(timestamp(0), timestamp(3)))
    );
    assert_eq!(
        snapshots[1].timestamps(),
        Some(CommandTimestamps::new(timestamp(4), timestamp(7)))
    );
    let executed = executed_snapshots(snapshots[0]);
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].command_buffer(), secondary);
}

#[test]
fn query_data_buffer_falls_back_to_host_reads() {
    let test = TestDevice::new();
    let command_buffer = test.allocate(vk::CommandBufferLevel::PRIMARY);
    let copy = test.device.allocate_command_buffer();
    test.record(
        command_buffer,
        vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        [dispatch()],
    );
    test.device.set_fail_buffer_creation(true);

    let mut query_data = test.profiler.create_query_data_buffer();
    assert!(!query_data.is_device_backed());

    let batch = test.profiler.submit(test.queue, &[&[command_buffer]]);
    test.profiler
        .record_query_data_copies(copy, &batch, &mut query_data)
        .unwrap();
    test.execute(&[command_buffer]);
    query_data.fetch();
    let data = test.profiler.collect_submit_batch_from(&batch, &query_data);

    assert!(test.device.recorded_commands(copy).is_empty());
    assert_eq!(
        data.submits[0].command_buffers[0].timestamps(),
        Some(CommandTimestamps::new(timestamp(0), timestamp(1)))
    );
}

#[test]
fn freed_command_buffers_are_forgotten() {
    let test = TestDevice::new();
    let kept = test.allocate(vk::CommandBufferLevel::PRIMARY);
    let freed = test.allocate(vk::CommandBufferLevel::PRIMARY);

    test.profiler.free_command_buffers(&[freed]);

    assert!(test.profiler.command_buffer(kept).is_some());
    assert!(test.profiler.command_buffer(freed).is_none());

    test.profiler.unregister_command_pool(test.graphics_pool);
    assert!(test.profiler.command_buffer(kept).is_none());
}

#[test]
fn command_buffers_from_unknown_pools_are_not_profiled() {
    let test = TestDevice::new();
    let command_buffer = test.device.allocate_command_buffer();
    test.profiler.allocate_command_buffers(
        test.device.allocate_command_pool(),
        vk::CommandBufferLevel::PRIMARY,
        &[command_buffer],
    );

    test.record(
        command_buffer,
        vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        [dispatch()],
    );

    assert!(
        !test
            .profiler
            .command_buffer(command_buffer)
            .unwrap()
            .lock()
            .is_profiling_enabled()
    );
    assert!(test.device.recorded_commands(command_buffer).is_empty());
}

#[test]
fn resetting_pool_resets_its_command_buffers() {
    let test = TestDevice::new();
    let command_buffer = test.allocate(vk::CommandBufferLevel::PRIMARY);
    test.record(
        command_buffer,
        vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        [dispatch()],
    );

    test.profiler.reset_command_pool(test.graphics_pool);

    let command_buffer = test.profiler.command_buffer(command_buffer).unwrap();
    assert!(command_buffer.lock().recorded_commands().is_none());
}

#[test]
fn unregistering_pool_while_collecting_primary_data_completes() {
    let test = Arc::new(TestDevice::new());
    let other_pool = test.device.allocate_command_pool();
    test.profiler
        .register_command_pool(other_pool, vk::QueueFlags::GRAPHICS);
    let other = test.device.allocate_command_buffer();
    test.profiler
        .allocate_command_buffers(other_pool, vk::CommandBufferLevel::PRIMARY, &[other]);

    let secondary = test.allocate(vk::CommandBufferLevel::SECONDARY);
    let primary = test.allocate(vk::CommandBufferLevel::PRIMARY);
    test.record_secondary(secondary, 2);
    test.record(
        primary,
        vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        [
            dispatch(),
            Command::BeginRenderPass(BeginRenderPass {
                render_pass: vk::RenderPass::from_raw(5),
                framebuffer: vk::Framebuffer::from_raw(6),
                contents: vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
            }),
            Command::ExecuteCommands(ExecuteCommands {
                command_buffers: vec![secondary],
                snapshots: Vec::new(),
            }),
            Command::EndRenderPass,
        ],
    );
    test.profiler.submit(test.queue, &[&[primary]]);
    test.execute(&[primary]);

    // The primary stays locked while its own results are read, and looks up
    // the secondary in the registry afterwards.
    test.device.set_result_read_delay(Duration::from_millis(300));

    let (sender, receiver) = mpsc::channel();
    let collector = {
        let test = test.clone();
        let sender = sender.clone();
        thread::spawn(move || {
            let snapshot = test.profiler.command_buffer_data(primary);
            sender.send("collected").unwrap();
            snapshot
        })
    };
    let unregisterer = {
        let test = test.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            test.profiler.unregister_command_pool(other_pool);
            sender.send("unregistered").unwrap();
        })
    };

    let mut finished: Vec<_> = (0..2)
        .map(|_| {
            receiver
                .recv_timeout(Duration::from_secs(10))
                .expect("collecting and unregistering blocked each other")
        })
        .collect();
    finished.sort_unstable();
    assert_eq!(finished, ["collected", "unregistered"]);

    unregisterer.join().unwrap();
    let snapshot = collector.join().unwrap().unwrap();
    assert_eq!(executed_snapshots(&snapshot).len(), 1);
    assert_eq!(snapshot.stats().draw_count, 2);
    assert_eq!(snapshot.stats().dispatch_count, 1);

    assert!(test.profiler.command_buffer(other).is_none());
    assert!(test.profiler.command_buffer(primary).is_some());
    assert!(test.profiler.command_buffer(secondary).is_some());
}

#[test]
fn command_buffers_recorded_on_different_threads_keep_their_own_timestamps() {
    const N_DISPATCHES: [usize; 2] = [5, 3];

    let test = TestDevice::new();
    let churn_pool = test.device.allocate_command_pool();
    let command_buffers: Vec<_> = N_DISPATCHES
        .iter()
        .map(|_| test.allocate(vk::CommandBufferLevel::PRIMARY))
        .collect();

    thread::scope(|scope| {
        for (&command_buffer, &n_dispatches) in command_buffers.iter().zip(&N_DISPATCHES) {
            let test = &test;
            scope.spawn(move || {
                for _ in 0..20 {
                    test.record(
                        command_buffer,
                        vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                        (0..n_dispatches).map(|_| dispatch()),
                    );
                }
            });
        }

        let test = &test;
        scope.spawn(move || {
            for _ in 0..20 {
                test.profiler
                    .register_command_pool(churn_pool, vk::QueueFlags::COMPUTE);
                let churned = test.device.allocate_command_buffer();
                test.profiler.allocate_command_buffers(
                    churn_pool,
                    vk::CommandBufferLevel::PRIMARY,
                    &[churned],
                );
                test.record(
                    churned,
                    vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                    [dispatch()],
                );
                test.profiler.reset_command_pool(churn_pool);
                test.profiler.free_command_buffers(&[churned]);
                test.profiler.unregister_command_pool(churn_pool);
            }
        });
    });

    let batch = test.profiler.submit(test.queue, &[&command_buffers]);
    test.execute(&command_buffers);
    let data = test.profiler.collect_submit_batch(&batch);

    let mut n_written_before = 0;
    for (snapshot, &n_dispatches) in data.snapshots().zip(&N_DISPATCHES) {
        let n_queries = 2 * n_dispatches as u64;
        let command_buffer = test.profiler.command_buffer(snapshot.command_buffer()).unwrap();
        assert_eq!(
            command_buffer.lock().query_pool().unwrap().query_count() as u64,
            n_queries
        );

        assert_eq!(
            snapshot.timestamps(),
            Some(CommandTimestamps::new(
                timestamp(n_written_before),
                timestamp(n_written_before + n_queries - 1)
            ))
        );
        let leaf_timestamps: Vec<_> = snapshot
            .commands()
            .leaves()
            .map(|node| node.timestamps())
            .collect();
        let expected: Vec<_> = (0..n_dispatches as u64)
            .map(|i| {
                let first = n_written_before + 2 * i;
                Some(CommandTimestamps::new(timestamp(first), timestamp(first + 1)))
            })
            .collect();
        assert_eq!(leaf_timestamps, expected);

        n_written_before += n_queries;
    }
    assert_eq!(data.snapshots().count(), 2);
}
