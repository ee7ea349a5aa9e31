use comet_rt::{
    channel::Channel, engine::Engine, fiber::Fiber, shared_state::SharedState, value::Value,
    Config,
};

fn main() -> comet_rt::Result<()> {
    let mut config = Config::default();
    config.fiber_stacks = 4;
    config.verbose = std::env::args().any(|arg| arg == "-v");
    config.collection_log = true;
    let shared = SharedState::new(config);
    let main = shared.attach_current_thread("main")?;

    // generator fiber counting up until the root stops asking
    let counter = Fiber::create(&shared, |args| {
        let mut n = Value::from_args(args).as_int().unwrap_or(0);
        loop {
            let step = Fiber::yield_(vec![Value::Int(n)])?;
            n += step.as_int().unwrap_or(1);
        }
    });
    let mut total = 0;
    let mut next = counter.resume(vec![Value::Int(1)])?;
    for step in 1..=5 {
        total += next.as_int().unwrap_or(0);
        next = counter.resume(vec![Value::Int(step)])?;
    }
    println!("generator total: {}", total);

    // ping-pong between two engines over a pair of channels
    let ping = Channel::new(&shared);
    let pong = Channel::new(&shared);
    let player = {
        let ping = ping.clone();
        let pong = pong.clone();
        Engine::spawn(&shared, "pong", move || {
            let mut hits = 0;
            loop {
                match ping.receive()? {
                    Value::Int(ball) => {
                        hits += 1;
                        pong.send(Value::Int(ball + 1));
                    }
                    _ => break,
                }
            }
            Ok(Value::Int(hits))
        })?
    };
    let mut ball = 0;
    for _ in 0..1000 {
        ping.send(Value::Int(ball));
        ball = pong.receive()?.as_int().unwrap_or(0);
        let garbage = main.allocate(vec![Value::Int(ball)]);
        main.set_local("last", Value::Object(garbage));
    }
    ping.send(Value::Bool(false));
    println!("ball: {}, hits: {}", ball, player.value()?);

    shared.collect_garbage();
    println!("{}", shared.statistics());
    shared.shutdown();
    Ok(())
}
