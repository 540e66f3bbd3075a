use std::time::Instant;

use platoon_sim::{
    CollisionPolicy, Error, LaneAttributes, LaneId, Simulation, SimulationConfig, SpawnConfig,
    Spawner, VehicleAttributes, VehicleId,
};

const NUM_FRAMES: u32 = 1000;
const DT: f64 = 0.1; // s
const PLATOON_SIZE: usize = 4;

/// Three main lanes with an on-ramp merging from the right.
fn build_road(sim: &mut Simulation) -> Result<(Vec<LaneId>, LaneId), Error> {
    let main = (0..3)
        .map(|_| sim.add_lane(&LaneAttributes::main(0.0, 3000.0)))
        .collect::<Vec<_>>();
    let ramp = sim.add_lane(&LaneAttributes::ramp(300.0, 800.0));
    sim.set_adjacent(main[0], main[1])?;
    sim.set_adjacent(main[1], main[2])?;
    sim.set_adjacent(main[2], ramp)?;
    Ok((main, ramp))
}

/// Whether a failed join only means the vehicle has to try again later.
fn can_retry(err: &Error) -> bool {
    matches!(
        err,
        Error::PlatoonGapTooSmall { .. }
            | Error::NotBehindPlatoon { .. }
            | Error::PlatoonFull { .. }
            | Error::AlreadyInPlatoon { .. }
    )
}

/// Lets connected vehicles join the connected vehicle ahead of them.
fn form_platoons(sim: &mut Simulation) -> Result<(), Error> {
    let pairs = sim
        .iter_vehicles()
        .filter(|v| v.is_connected() && v.platoon_id().is_none())
        .filter_map(|v| {
            let front = sim.get_vehicle(v.front_vehicle()?)?;
            front.is_connected().then_some((front.id(), v.id()))
        })
        .collect::<Vec<(VehicleId, VehicleId)>>();

    for (front, rear) in pairs {
        let (platoon, created) = match sim.get_vehicle(front).and_then(|v| v.platoon_id()) {
            Some(platoon) => (platoon, false),
            None => (sim.create_platoon(front, PLATOON_SIZE)?, true),
        };
        match sim.add_to_platoon(platoon, rear) {
            Ok(()) => {}
            Err(err) if can_retry(&err) => {
                if created {
                    sim.dissolve_platoon(platoon)?;
                }
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut sim = Simulation::new(SimulationConfig {
        collision_policy: CollisionPolicy::RemoveVehicle,
        ..Default::default()
    });
    let (_, ramp) = build_road(&mut sim)?;
    let mut spawner = Spawner::new(
        SpawnConfig {
            permeability: 0.3,
            ..Default::default()
        },
        42,
    )?;
    let merging = VehicleAttributes::human_driven();

    println!("Simulating...");
    let mut total_exited = 0;
    let mut total_lane_changes = 0;
    for _ in 0..5 {
        let start = Instant::now();
        let mut lane_changes = 0;
        for _ in 0..NUM_FRAMES {
            spawner.try_spawn(&mut sim);
            if sim.frame() % 40 == 0 && sim.can_insert(ramp, &merging, 300.0, 10.0) {
                sim.add_vehicle(&merging, ramp, 300.0, 10.0)?;
            }
            form_platoons(&mut sim)?;
            let report = sim.step(DT)?;
            lane_changes += report.lane_changes;
            total_exited += report.exited.len();
        }
        total_lane_changes += lane_changes;
        let frame = start.elapsed() / NUM_FRAMES;
        println!(
            "Avg. frame: {:?} --> {:.0}x speedup ({} vehs, {} platoons, {} lane changes)",
            frame,
            DT / frame.as_secs_f64(),
            sim.iter_vehicles().count(),
            sim.iter_platoons().count(),
            lane_changes,
        );
    }

    let summary = serde_json::json!({
        "frames": sim.frame(),
        "vehicles": sim.iter_vehicles().count(),
        "platoons": sim.iter_platoons().count(),
        "exited": total_exited,
        "lane_changes": total_lane_changes,
        "mean_speed": sim.records().iter().map(|r| r.vel).sum::<f64>()
            / sim.iter_vehicles().count().max(1) as f64,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
