mod clear;
mod consume;
mod helper;
mod reconnect;
