mod common;

use grass_wind::*;

fn device() -> Option<Device> {
    common::device(DeviceConfig::default())
}

#[test]
fn acquire_and_release_must_alternate() {
    let Some(device) = device() else {
        return;
    };
    let stream = device.create_stream();
    let surface = Surface::new(&device, 16, 16, TextureFormat::Rgba32F).unwrap();
    let field = GridField::create_shared(&device, &surface, 2).unwrap();

    assert!(matches!(
        field.release(&stream),
        Err(FluidError::ProtocolViolation(_))
    ));
    field.acquire(&stream).unwrap();
    assert!(matches!(
        field.acquire(&stream),
        Err(FluidError::ProtocolViolation(_))
    ));
    assert!(matches!(
        surface.read_texels(),
        Err(FluidError::ProtocolViolation(_))
    ));
    field.release(&stream).unwrap();
    assert!(matches!(
        field.release(&stream),
        Err(FluidError::ProtocolViolation(_))
    ));

    let owned = GridField::create_owned(&device, 16, 16, 2).unwrap();
    owned.release(&stream).unwrap();
    owned.acquire(&stream).unwrap();
    owned.acquire(&stream).unwrap();
}

#[test]
fn shared_textures_are_zeroed_only_when_asked() {
    let Some(device) = device() else {
        return;
    };
    let velocity = Surface::new(&device, 8, 8, TextureFormat::Rgba32F).unwrap();
    let pressure = Surface::new(&device, 8, 8, TextureFormat::R32F).unwrap();
    velocity.write_texels(&[7.0; 8 * 8 * 4]).unwrap();
    pressure.write_texels(&[7.0; 8 * 8]).unwrap();
    let mut solver = FluidSolver::new(SolverConfig::new(8, 8));
    solver
        .create(&device, Some(&velocity), Some(&pressure))
        .unwrap();
    assert!(velocity.read_texels().unwrap().iter().all(|v| *v == 0.0));
    assert!(pressure.read_texels().unwrap().iter().all(|v| *v == 0.0));
    assert!(solver.velocities().unwrap().is_shared());
    assert!(solver.pressure().unwrap().is_shared());

    let untouched = Surface::new(&device, 8, 8, TextureFormat::Rgba32F).unwrap();
    untouched.write_texels(&[7.0; 8 * 8 * 4]).unwrap();
    let mut solver = FluidSolver::new(SolverConfig {
        zero_initialize_shared_textures: false,
        ..SolverConfig::new(8, 8)
    });
    solver.create(&device, Some(&untouched), None).unwrap();
    assert!(untouched.read_texels().unwrap().iter().all(|v| *v == 7.0));
}

#[test]
fn release_returns_device_memory_but_not_surfaces() {
    let Some(device) = device() else {
        return;
    };
    let surface = Surface::new(&device, 32, 32, TextureFormat::Rgba32F).unwrap();
    let mut solver = FluidSolver::new(SolverConfig::new(32, 32));
    solver.create(&device, Some(&surface), None).unwrap();
    // pressure plus two 2-channel scratch fields
    assert_eq!(device.allocated_texels(), 32 * 32 * 5);
    solver.step(0.05, None).unwrap();
    solver.release().unwrap();
    assert_eq!(solver.state(), SolverState::Released);
    assert_eq!(device.allocated_texels(), 0);
    assert_eq!(surface.owner(), SurfaceOwner::Graphics);
    surface.write_texels(&vec![1.0; 32 * 32 * 4]).unwrap();
    assert!(matches!(
        solver.step(0.05, None),
        Err(FluidError::InvalidState(_))
    ));
}

#[test]
fn dropping_a_solver_mid_window_hands_surfaces_back() {
    let Some(device) = device() else {
        return;
    };
    let surface = Surface::new(&device, 8, 8, TextureFormat::Rgba32F).unwrap();
    {
        let mut solver = FluidSolver::new(SolverConfig::new(8, 8));
        solver.create(&device, Some(&surface), None).unwrap();
        let velocity = solver.velocities().unwrap();
        velocity.acquire(solver.stream().unwrap()).unwrap();
        solver.update(0.1, None).unwrap();
        assert_eq!(surface.owner(), SurfaceOwner::Compute);
    }
    assert_eq!(surface.owner(), SurfaceOwner::Graphics);
    assert!(surface.read_texels().unwrap().iter().all(|v| *v == 0.0));
}

#[test]
fn cpu_work_item_limits_surface_as_dispatch_errors() {
    let Some(device) = common::device(DeviceConfig::cpu()) else {
        return;
    };
    let mut solver = FluidSolver::new(SolverConfig::new(64, 64));
    solver.create(&device, None, None).unwrap();
    match solver.update(0.1, None) {
        Err(FluidError::Dispatch { kernel, limits, .. }) => {
            assert_eq!(kernel, "advect");
            assert_eq!(limits.max_work_item_sizes[1], 1);
        }
        other => panic!("expected a dispatch error, got {:?}", other),
    }
    assert_eq!(solver.state(), SolverState::Ready);
}

#[test]
fn missing_group_size_is_a_device_query_error() {
    let Some(device) = common::device(DeviceConfig {
        preferred_work_group_size: None,
        ..Default::default()
    }) else {
        return;
    };
    let mut solver = FluidSolver::new(SolverConfig::new(16, 16));
    solver.create(&device, None, None).unwrap();
    assert!(matches!(
        solver.update(0.1, None),
        Err(FluidError::DeviceQuery(_))
    ));
}

#[test]
fn shared_surfaces_need_a_capable_device() {
    let Some(device) = common::device(DeviceConfig::cpu()) else {
        return;
    };
    let surface = Surface::new(&device, 16, 16, TextureFormat::Rgba32F).unwrap();
    let mut solver = FluidSolver::new(SolverConfig::new(16, 16));
    assert!(matches!(
        solver.create(&device, Some(&surface), None),
        Err(FluidError::ResourceBind { .. })
    ));
    assert_eq!(solver.state(), SolverState::Uninitialized);
    assert_eq!(device.allocated_texels(), 0);
}
