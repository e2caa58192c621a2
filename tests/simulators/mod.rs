pub mod inverter_simulator;
